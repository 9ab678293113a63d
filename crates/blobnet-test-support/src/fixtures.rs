//! Small fixtures shared by integration suites.

use std::sync::Once;

use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call from
/// every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A fresh temp directory for one test's store root.
///
/// # Panics
///
/// Panics when the temp directory cannot be created.
#[must_use]
pub fn temp_root() -> TempDir {
    tempfile::Builder::new()
        .prefix("blobnet-test-")
        .tempdir()
        .expect("create temp root")
}
