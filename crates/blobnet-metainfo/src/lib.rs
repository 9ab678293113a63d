#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! Content digests and torrent metainfo for the blobnet content store.
//!
//! Blobs are identified by their SHA-256 digest; the torrent layer slices
//! them into fixed-size pieces whose SHA-1 hashes live in a canonical
//! bencoded metainfo dictionary. Layout: `digest.rs` (content identity),
//! `info.rs` (metainfo model + piece arithmetic), `error.rs`.

pub mod digest;
pub mod error;
pub mod info;

pub use digest::{DIGEST_LEN, Digest};
pub use error::{MetainfoError, MetainfoResult};
pub use info::{Info, Metainfo, PIECE_HASH_LEN};
