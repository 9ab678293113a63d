//! The per-piece status byte and its state machine.
//!
//! One byte per piece in the `_piece_status` sidecar is the single
//! source of truth for completion:
//!
//! ```text
//! empty --[writer claims]-->  dirty
//! dirty --[write succeeds]--> done   (--> clean on failure/abort)
//! clean --[writer claims]-->  dirty
//! done  --terminal within a torrent's lifecycle
//! ```

use crate::error::{TorrentError, TorrentResult};

/// Status of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// Never written.
    Empty,
    /// A writer holds the piece.
    Dirty,
    /// Written and hash-verified; terminal.
    Done,
    /// Allocated, or released by a failed writer; claimable again.
    Clean,
}

impl PieceStatus {
    /// The sidecar byte for this status.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Dirty => 1,
            Self::Done => 2,
            Self::Clean => 3,
        }
    }

    /// Decode a sidecar byte.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::CorruptPieceStatus`] for unknown bytes.
    pub const fn from_byte(piece: usize, value: u8) -> TorrentResult<Self> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Dirty),
            2 => Ok(Self::Done),
            3 => Ok(Self::Clean),
            _ => Err(TorrentError::CorruptPieceStatus { piece, value }),
        }
    }

    /// Whether a writer may claim the piece from this status.
    #[must_use]
    pub const fn claimable(self) -> bool {
        matches!(self, Self::Empty | Self::Clean)
    }
}

/// Number of done bytes in a raw status array.
#[must_use]
pub fn count_done(status: &[u8]) -> usize {
    status
        .iter()
        .filter(|&&byte| byte == PieceStatus::Done.to_byte())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() -> anyhow::Result<()> {
        for status in [
            PieceStatus::Empty,
            PieceStatus::Dirty,
            PieceStatus::Done,
            PieceStatus::Clean,
        ] {
            assert_eq!(PieceStatus::from_byte(0, status.to_byte())?, status);
        }
        assert!(matches!(
            PieceStatus::from_byte(4, 9),
            Err(TorrentError::CorruptPieceStatus { piece: 4, value: 9 })
        ));
        Ok(())
    }

    #[test]
    fn claimability() {
        assert!(PieceStatus::Empty.claimable());
        assert!(PieceStatus::Clean.claimable());
        assert!(!PieceStatus::Dirty.claimable());
        assert!(!PieceStatus::Done.claimable());
    }

    #[test]
    fn done_counting() {
        assert_eq!(count_done(&[0, 1, 2, 2, 3]), 2);
        assert_eq!(count_done(&[]), 0);
    }
}
