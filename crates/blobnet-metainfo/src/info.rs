//! Bencoded metainfo model and piece arithmetic.
//!
//! The wire form is the canonical bencoding of
//! `{info: {length, name, piece length, pieces}}`; the info-hash is the
//! SHA-1 of the bencoded info dictionary. Field declaration order below
//! matches the canonical (lexicographic) bencode key order, so encoding
//! a struct yields the canonical bytes directly.

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

use crate::digest::Digest;
use crate::error::{MetainfoError, MetainfoResult};

/// Length of one SHA-1 piece hash in bytes.
pub const PIECE_HASH_LEN: usize = 20;

/// The bencoded info dictionary of a single-blob torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Total blob length in bytes.
    pub length: u64,
    /// Blob name: the lowercase hex content digest.
    pub name: String,
    /// Nominal piece length in bytes.
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// Concatenated SHA-1 piece hashes, 20 bytes each.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
}

/// Torrent metainfo wrapping the info dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metainfo {
    /// The info dictionary whose SHA-1 is the torrent's identity.
    pub info: Info,
}

impl Metainfo {
    /// Build metainfo for a blob from its digest, length and piece hashes.
    ///
    /// # Errors
    ///
    /// Returns an error when `piece_length` is zero or the pieces blob is
    /// not a whole number of hashes matching the declared length.
    pub fn new(
        digest: &Digest,
        length: u64,
        piece_length: u64,
        pieces: Vec<u8>,
    ) -> MetainfoResult<Self> {
        if piece_length == 0 {
            return Err(MetainfoError::InvalidField {
                field: "piece_length",
                reason: "zero",
            });
        }
        if pieces.len() % PIECE_HASH_LEN != 0 {
            return Err(MetainfoError::InvalidPieces {
                reason: "not a whole number of sha1 hashes",
            });
        }
        let expected = expected_piece_count(length, piece_length);
        if pieces.len() / PIECE_HASH_LEN != expected {
            return Err(MetainfoError::InvalidPieces {
                reason: "hash count disagrees with length and piece length",
            });
        }
        Ok(Self {
            info: Info {
                length,
                name: digest.to_hex(),
                piece_length,
                pieces,
            },
        })
    }

    /// Decode metainfo from its bencoded form.
    ///
    /// # Errors
    ///
    /// Returns a bencode error when the bytes are not a valid metainfo
    /// dictionary.
    pub fn from_bytes(bytes: &[u8]) -> MetainfoResult<Self> {
        serde_bencode::from_bytes(bytes).map_err(|e| MetainfoError::bencode("decode", e))
    }

    /// Canonical bencoded form of the whole metainfo.
    ///
    /// # Errors
    ///
    /// Returns a bencode error when encoding fails.
    pub fn to_bytes(&self) -> MetainfoResult<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(|e| MetainfoError::bencode("encode", e))
    }

    /// SHA-1 of the canonical bencoded info dictionary.
    ///
    /// # Errors
    ///
    /// Returns a bencode error when encoding the info dictionary fails.
    pub fn info_hash(&self) -> MetainfoResult<[u8; PIECE_HASH_LEN]> {
        let encoded =
            serde_bencode::to_bytes(&self.info).map_err(|e| MetainfoError::bencode("encode", e))?;
        Ok(Sha1::digest(&encoded).into())
    }

    /// The content digest this metainfo describes.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::InvalidDigest`] when the name field is
    /// not a valid digest.
    pub fn digest(&self) -> MetainfoResult<Digest> {
        Digest::from_hex(&self.info.name)
    }

    /// Total blob length in bytes.
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.info.length
    }

    /// Nominal piece length in bytes.
    #[must_use]
    pub const fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    /// Number of pieces in the torrent.
    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / PIECE_HASH_LEN
    }

    /// Length of the piece at `index`; the last piece may be shorter.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::InvalidPieceIndex`] for an out-of-range
    /// index.
    pub fn piece_len(&self, index: usize) -> MetainfoResult<u64> {
        let count = self.piece_count();
        if index + 1 == count {
            Ok(self.info.length - self.info.piece_length * (count as u64 - 1))
        } else if index + 1 < count {
            Ok(self.info.piece_length)
        } else {
            Err(MetainfoError::InvalidPieceIndex {
                index,
                piece_count: count,
            })
        }
    }

    /// Expected SHA-1 hash of the piece at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::InvalidPieceIndex`] for an out-of-range
    /// index.
    pub fn piece_hash(&self, index: usize) -> MetainfoResult<[u8; PIECE_HASH_LEN]> {
        let count = self.piece_count();
        if index >= count {
            return Err(MetainfoError::InvalidPieceIndex {
                index,
                piece_count: count,
            });
        }
        let start = index * PIECE_HASH_LEN;
        let mut hash = [0_u8; PIECE_HASH_LEN];
        hash.copy_from_slice(&self.info.pieces[start..start + PIECE_HASH_LEN]);
        Ok(hash)
    }
}

/// Number of pieces a blob of `length` splits into at `piece_length`.
#[must_use]
pub(crate) const fn expected_piece_count(length: u64, piece_length: u64) -> usize {
    (length.div_ceil(piece_length)) as usize
}
