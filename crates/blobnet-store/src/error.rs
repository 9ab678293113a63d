//! # Design
//!
//! - Structured, constant-message errors for the content store.
//! - Capture operation context (names, paths, states) so failures are
//!   reproducible in tests without string matching.
//! - Preserve source errors without interpolating context into messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by the content-addressable file store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO failures while interacting with the filesystem.
    #[error("store io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The named file is absent from every acceptable state.
    #[error("file not found")]
    FileNotFound {
        /// Name of the missing file.
        name: String,
    },
    /// A metadata sidecar is absent for the named file.
    #[error("file metadata not found")]
    MetadataNotFound {
        /// Name of the file.
        name: String,
        /// Suffix of the missing sidecar.
        suffix: String,
    },
    /// The target already exists.
    #[error("file already exists")]
    FileExists {
        /// Name of the existing file.
        name: String,
    },
    /// The file's current state is outside the operation's acceptable set.
    #[error("file in wrong state")]
    FileState {
        /// Name of the file.
        name: String,
        /// Directory of the state the file is actually in.
        actual: PathBuf,
        /// Directories of the states the operation accepts.
        expected: Vec<PathBuf>,
    },
    /// A file name contained forbidden components.
    #[error("invalid file name")]
    InvalidName {
        /// Offending name.
        name: String,
        /// Static reason for the rejection.
        reason: &'static str,
    },
    /// Deletion was blocked by a `persist=true` sidecar.
    #[error("file persisted")]
    FilePersisted {
        /// Name of the persisted file.
        name: String,
    },
    /// A metadata sidecar failed to (de)serialize.
    #[error("invalid metadata payload")]
    InvalidMetadata {
        /// Suffix of the sidecar.
        suffix: String,
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// A store configuration value failed validation.
    #[error("invalid store configuration")]
    Config {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
    },
}

impl StoreError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn file_not_found(name: impl Into<String>) -> Self {
        Self::FileNotFound { name: name.into() }
    }

    pub(crate) fn metadata_not_found(name: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::MetadataNotFound {
            name: name.into(),
            suffix: suffix.into(),
        }
    }

    pub(crate) fn exists(name: impl Into<String>) -> Self {
        Self::FileExists { name: name.into() }
    }

    pub(crate) fn persisted(name: impl Into<String>) -> Self {
        Self::FilePersisted { name: name.into() }
    }

    /// True when the error reports an absent file or sidecar.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound { .. } | Self::MetadataNotFound { .. }
        )
    }

    /// True when the error reports an already-present target.
    #[must_use]
    pub const fn is_exists(&self) -> bool {
        matches!(self, Self::FileExists { .. })
    }
}
