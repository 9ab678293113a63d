//! Error primitives for digest parsing and metainfo encoding.

use thiserror::Error;

/// Result type for metainfo operations.
pub type MetainfoResult<T> = Result<T, MetainfoError>;

/// Errors produced while handling digests and metainfo.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// Bencode encoding or decoding failed.
    #[error("metainfo bencode failure")]
    Bencode {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Underlying bencode error.
        source: serde_bencode::Error,
    },
    /// A digest string was not 64 lowercase hex characters.
    #[error("invalid content digest")]
    InvalidDigest {
        /// Offending input value.
        value: String,
    },
    /// A piece index was outside the torrent's piece count.
    #[error("piece index out of range")]
    InvalidPieceIndex {
        /// Requested piece index.
        index: usize,
        /// Number of pieces in the torrent.
        piece_count: usize,
    },
    /// The pieces blob was not a whole number of SHA-1 hashes, or its
    /// hash count disagreed with the declared length and piece length.
    #[error("malformed pieces blob")]
    InvalidPieces {
        /// Static reason for the failure.
        reason: &'static str,
    },
    /// A metainfo field failed validation.
    #[error("invalid metainfo field")]
    InvalidField {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
    },
}

impl MetainfoError {
    pub(crate) const fn bencode(operation: &'static str, source: serde_bencode::Error) -> Self {
        Self::Bencode { operation, source }
    }
}
