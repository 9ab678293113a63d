//! The pluggable backend client seam.

use async_trait::async_trait;

use crate::error::BackendResult;

/// Size information for a backend blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    /// Blob length in bytes.
    pub size: u64,
}

/// Listing knobs; the zero value lists everything in one page.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Return at most `max_keys` names per call with a continuation
    /// token.
    pub paginated: bool,
    /// Page size when `paginated` is set.
    pub max_keys: usize,
    /// Token from a previous page.
    pub continuation_token: Option<String>,
}

/// One page of listed names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    /// Names under the requested prefix.
    pub names: Vec<String>,
    /// Token for the next page; `None` when exhausted.
    pub continuation_token: Option<String>,
}

/// A storage backend the distribution fleet reads blobs from and writes
/// blobs to. Implementations must be shareable across tasks.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Size of `name`, or [`BackendError::BlobNotFound`] when absent.
    ///
    /// [`BackendError::BlobNotFound`]: crate::error::BackendError::BlobNotFound
    async fn stat(&self, namespace: &str, name: &str) -> BackendResult<BlobInfo>;

    /// Upload the full contents of `source` as `name`.
    async fn upload(
        &self,
        namespace: &str,
        name: &str,
        source: &mut (dyn std::io::Read + Send),
    ) -> BackendResult<()>;

    /// Download `name` into `sink`; returns the number of bytes written.
    async fn download(
        &self,
        namespace: &str,
        name: &str,
        sink: &mut (dyn std::io::Write + Send),
    ) -> BackendResult<u64>;

    /// List names under `prefix`, recursively.
    async fn list(&self, prefix: &str, options: ListOptions) -> BackendResult<ListResult>;
}
