//! Error primitives for the torrent storage layer.

use blobnet_backend::BackendError;
use blobnet_metainfo::MetainfoError;
use blobnet_store::StoreError;
use thiserror::Error;

/// Result type for torrent storage operations.
pub type TorrentResult<T> = Result<T, TorrentError>;

/// Errors produced by torrent handles, the archive and the generator.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// No torrent is known for the digest; a blob refresh may be
    /// underway.
    #[error("torrent not found")]
    NotFound {
        /// Digest that failed to resolve.
        digest: String,
    },
    /// The blob is already cached; a writable torrent cannot be created.
    #[error("torrent already exists")]
    Exists {
        /// Digest of the cached blob.
        digest: String,
    },
    /// A write was attempted on an origin (read-only) torrent.
    #[error("torrent is read only")]
    ReadOnly {
        /// Digest of the read-only torrent.
        digest: String,
    },
    /// Another writer holds the piece.
    #[error("piece claimed by another writer")]
    PieceConflict {
        /// Index of the contested piece.
        piece: usize,
    },
    /// The piece index is outside the torrent.
    #[error("piece index out of range")]
    PieceOutOfRange {
        /// Requested piece index.
        piece: usize,
        /// Number of pieces in the torrent.
        piece_count: usize,
    },
    /// The supplied piece has the wrong length.
    #[error("piece length mismatch")]
    PieceSize {
        /// Index of the piece.
        piece: usize,
        /// Expected piece length in bytes.
        expected: u64,
        /// Supplied length in bytes.
        actual: u64,
    },
    /// The written piece failed its hash check.
    #[error("piece hash mismatch")]
    HashMismatch {
        /// Index of the piece.
        piece: usize,
    },
    /// The piece-status sidecar held an unknown status byte.
    #[error("corrupt piece status")]
    CorruptPieceStatus {
        /// Index of the piece.
        piece: usize,
        /// Offending status byte.
        value: u8,
    },
    /// The cached blob disagrees with its metainfo.
    #[error("blob inconsistent with metainfo")]
    Inconsistent {
        /// Digest of the blob.
        digest: String,
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// A generator or archive configuration value failed validation.
    #[error("invalid torrent configuration")]
    Config {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// Local IO failed outside the store's bookkeeping.
    #[error("torrent io failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The underlying file store failed.
    #[error("torrent store failure")]
    Store {
        /// Underlying store error.
        #[from]
        source: StoreError,
    },
    /// Metainfo encoding or validation failed.
    #[error("torrent metainfo failure")]
    Metainfo {
        /// Underlying metainfo error.
        #[from]
        source: MetainfoError,
    },
    /// A backend interaction failed.
    #[error("torrent backend failure")]
    Backend {
        /// Underlying backend error.
        #[from]
        source: BackendError,
    },
}

impl TorrentError {
    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// True when the error reports an unknown torrent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
