#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs)]

//! Shared test rig for the blobnet workspace: the in-memory test
//! backend server speaking the fleet's wire protocol, temp-root
//! helpers, and opt-in tracing initialization.

pub mod fixtures;
pub mod server;

pub use fixtures::{init_tracing, temp_root};
pub use server::TestBackendServer;
