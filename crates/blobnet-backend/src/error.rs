//! Error primitives for backend clients and the namespace router.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors produced by backend clients and routing.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The named blob does not exist on the backend.
    #[error("backend blob not found")]
    BlobNotFound {
        /// Name of the missing blob.
        name: String,
    },
    /// The listed prefix does not exist on the backend.
    #[error("backend directory not found")]
    DirNotFound {
        /// Prefix that failed to list.
        prefix: String,
    },
    /// An HTTP request failed at the transport level.
    #[error("backend http failure")]
    Http {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Underlying transport error.
        source: reqwest::Error,
    },
    /// The backend answered with an unexpected status or payload.
    #[error("backend invalid response")]
    InvalidResponse {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Static reason for the rejection.
        reason: &'static str,
        /// HTTP status code when one was received.
        status: Option<u16>,
    },
    /// Local IO failed while streaming to or from the backend.
    #[error("backend io failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// No registered binding matched the namespace.
    #[error("no backend for namespace")]
    NamespaceNotFound {
        /// Namespace that failed to route.
        namespace: String,
    },
    /// A client or router configuration value failed validation.
    #[error("invalid backend configuration")]
    Config {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
    },
}

impl BackendError {
    pub(crate) fn http(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Http { operation, source }
    }

    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// True when the error reports a missing blob or prefix.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::BlobNotFound { .. } | Self::DirNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(
            BackendError::BlobNotFound {
                name: "a".to_string()
            }
            .is_not_found()
        );
        assert!(
            BackendError::DirNotFound {
                prefix: "p".to_string()
            }
            .is_not_found()
        );
        assert!(
            !BackendError::NamespaceNotFound {
                namespace: "n".to_string()
            }
            .is_not_found()
        );
    }
}
