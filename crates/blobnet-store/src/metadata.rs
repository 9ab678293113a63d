//! Metadata sidecar kinds and the process-wide suffix registry.
//!
//! Every sidecar kind is one variant of the closed [`Metadata`] enum; the
//! registry is an immutable list of `(regex, factory)` pairs consulted
//! when reloading entries from disk. Registry invariants: suffix regexes
//! are disjoint, and `deserialize(serialize(x)) == x` for every kind.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{StoreError, StoreResult};

/// Suffix of the persist flag sidecar.
pub const SUFFIX_PERSIST: &str = "_persist";
/// Suffix of the last-access-time sidecar.
pub const SUFFIX_LAST_ACCESS_TIME: &str = "_last_access_time";
/// Suffix of the piece-status sidecar.
pub const SUFFIX_PIECE_STATUS: &str = "_piece_status";
/// Suffix of the torrent metainfo sidecar.
pub const SUFFIX_TORRENT_META: &str = "_torrent_meta";
/// Suffix of the upload start-time sidecar.
pub const SUFFIX_STARTED_AT: &str = "_started_at";
/// Suffix prefix of resumable-upload hasher state sidecars; the
/// `<algo>/<offset>` tail is part of the suffix.
pub const SUFFIX_HASH_STATE_PREFIX: &str = "_hashstates/";
/// Suffix of the reference-count sidecar.
pub const SUFFIX_REFCOUNT: &str = "_refcount";

/// One metadata sidecar kind together with its payload.
///
/// Each variant declares its fixed suffix, whether it follows the data
/// file across state transitions, and its byte representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    /// Deletion guard; `true` blocks `delete` and LRU eviction.
    Persist(bool),
    /// Unix seconds of the last qualifying access, 8 bytes little-endian.
    LastAccessTime(u64),
    /// One status byte per torrent piece.
    PieceStatus(Vec<u8>),
    /// Canonical bencoded torrent metainfo.
    TorrentMeta(Vec<u8>),
    /// Registry upload start time, RFC 3339 text.
    StartedAt(DateTime<Utc>),
    /// Docker resumable-upload hasher state, keyed by algorithm and
    /// byte offset.
    HashState {
        /// Hash algorithm the state belongs to (e.g. `sha256`).
        algo: String,
        /// Byte offset the hasher had consumed when the state was saved.
        offset: String,
        /// Opaque serialized hasher state.
        bytes: Vec<u8>,
    },
    /// Unsigned LEB128 reference count for ref-counted files.
    RefCount(u64),
    /// Movable test-only kind.
    #[cfg(test)]
    MockOne(Vec<u8>),
    /// Non-movable test-only kind.
    #[cfg(test)]
    MockTwo(Vec<u8>),
}

impl Metadata {
    /// The sidecar file name, relative to the entry directory.
    #[must_use]
    pub fn suffix(&self) -> String {
        match self {
            Self::Persist(_) => SUFFIX_PERSIST.to_string(),
            Self::LastAccessTime(_) => SUFFIX_LAST_ACCESS_TIME.to_string(),
            Self::PieceStatus(_) => SUFFIX_PIECE_STATUS.to_string(),
            Self::TorrentMeta(_) => SUFFIX_TORRENT_META.to_string(),
            Self::StartedAt(_) => SUFFIX_STARTED_AT.to_string(),
            Self::HashState { algo, offset, .. } => {
                format!("{SUFFIX_HASH_STATE_PREFIX}{algo}/{offset}")
            }
            Self::RefCount(_) => SUFFIX_REFCOUNT.to_string(),
            #[cfg(test)]
            Self::MockOne(_) => "_mock_one".to_string(),
            #[cfg(test)]
            Self::MockTwo(_) => "_mock_two".to_string(),
        }
    }

    /// Whether the sidecar follows the data file on state transitions.
    ///
    /// Upload-staging artifacts (start time, hasher state) are dropped on
    /// promotion; everything else travels with the blob.
    #[must_use]
    pub const fn movable(&self) -> bool {
        match self {
            Self::Persist(_)
            | Self::LastAccessTime(_)
            | Self::PieceStatus(_)
            | Self::TorrentMeta(_)
            | Self::RefCount(_) => true,
            Self::StartedAt(_) | Self::HashState { .. } => false,
            #[cfg(test)]
            Self::MockOne(_) => true,
            #[cfg(test)]
            Self::MockTwo(_) => false,
        }
    }

    /// Byte representation written to the sidecar file.
    ///
    /// # Errors
    ///
    /// Currently infallible for all kinds; kept fallible to match the
    /// registry contract.
    pub fn serialize(&self) -> StoreResult<Vec<u8>> {
        match self {
            Self::Persist(flag) => Ok(vec![u8::from(*flag)]),
            Self::LastAccessTime(seconds) => Ok(seconds.to_le_bytes().to_vec()),
            Self::PieceStatus(bytes) | Self::TorrentMeta(bytes) => Ok(bytes.clone()),
            Self::StartedAt(at) => Ok(at.to_rfc3339().into_bytes()),
            Self::HashState { bytes, .. } => Ok(bytes.clone()),
            Self::RefCount(count) => Ok(encode_varint(*count)),
            #[cfg(test)]
            Self::MockOne(bytes) | Self::MockTwo(bytes) => Ok(bytes.clone()),
        }
    }

    /// Fill this value from the sidecar file's bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidMetadata`] when the bytes do not
    /// decode as this kind.
    pub fn deserialize_into(&mut self, bytes: &[u8]) -> StoreResult<()> {
        match self {
            Self::Persist(flag) => {
                *flag = match bytes {
                    [0] => false,
                    [1] => true,
                    _ => {
                        return Err(StoreError::InvalidMetadata {
                            suffix: SUFFIX_PERSIST.to_string(),
                            reason: "expected a single 0/1 byte",
                        });
                    }
                };
            }
            Self::LastAccessTime(seconds) => {
                let raw: [u8; 8] =
                    bytes
                        .try_into()
                        .map_err(|_| StoreError::InvalidMetadata {
                            suffix: SUFFIX_LAST_ACCESS_TIME.to_string(),
                            reason: "expected 8 little-endian bytes",
                        })?;
                *seconds = u64::from_le_bytes(raw);
            }
            Self::PieceStatus(payload) | Self::TorrentMeta(payload) => {
                *payload = bytes.to_vec();
            }
            Self::StartedAt(at) => {
                let text =
                    std::str::from_utf8(bytes).map_err(|_| StoreError::InvalidMetadata {
                        suffix: SUFFIX_STARTED_AT.to_string(),
                        reason: "expected utf-8 rfc3339 text",
                    })?;
                *at = DateTime::parse_from_rfc3339(text)
                    .map_err(|_| StoreError::InvalidMetadata {
                        suffix: SUFFIX_STARTED_AT.to_string(),
                        reason: "expected rfc3339 timestamp",
                    })?
                    .with_timezone(&Utc);
            }
            Self::HashState { bytes: payload, .. } => {
                *payload = bytes.to_vec();
            }
            Self::RefCount(count) => {
                *count = decode_varint(bytes).ok_or_else(|| StoreError::InvalidMetadata {
                    suffix: SUFFIX_REFCOUNT.to_string(),
                    reason: "expected unsigned leb128 varint",
                })?;
            }
            #[cfg(test)]
            Self::MockOne(payload) | Self::MockTwo(payload) => {
                *payload = bytes.to_vec();
            }
        }
        Ok(())
    }
}

type Factory = fn(&str) -> Metadata;

/// Immutable suffix registry: the first factory whose regex matches a
/// suffix builds a default-valued kind for it.
static REGISTRY: Lazy<Vec<(Regex, Factory)>> = Lazy::new(|| {
    let mut registry: Vec<(Regex, Factory)> = vec![
        (anchored(SUFFIX_PERSIST), |_| Metadata::Persist(false)),
        (anchored(SUFFIX_LAST_ACCESS_TIME), |_| {
            Metadata::LastAccessTime(0)
        }),
        (anchored(SUFFIX_PIECE_STATUS), |_| {
            Metadata::PieceStatus(Vec::new())
        }),
        (anchored(SUFFIX_TORRENT_META), |_| {
            Metadata::TorrentMeta(Vec::new())
        }),
        (anchored(SUFFIX_STARTED_AT), |_| {
            Metadata::StartedAt(DateTime::<Utc>::UNIX_EPOCH)
        }),
        (
            Regex::new(r"^_hashstates/\w+/\w+$").expect("static regex"),
            |suffix| {
                let tail = &suffix[SUFFIX_HASH_STATE_PREFIX.len()..];
                let (algo, offset) = tail.split_once('/').expect("regex guarantees two segments");
                Metadata::HashState {
                    algo: algo.to_string(),
                    offset: offset.to_string(),
                    bytes: Vec::new(),
                }
            },
        ),
        (anchored(SUFFIX_REFCOUNT), |_| Metadata::RefCount(0)),
    ];
    #[cfg(test)]
    {
        registry.push((anchored("_mock_one"), |_| Metadata::MockOne(Vec::new())));
        registry.push((anchored("_mock_two"), |_| Metadata::MockTwo(Vec::new())));
    }
    registry
});

fn anchored(suffix: &str) -> Regex {
    Regex::new(&format!("^{}$", regex::escape(suffix))).expect("static regex")
}

/// Build a default-valued kind for a sidecar suffix found on disk, or
/// `None` when the suffix names no registered kind.
#[must_use]
pub fn from_suffix(suffix: &str) -> Option<Metadata> {
    REGISTRY
        .iter()
        .find(|(regex, _)| regex.is_match(suffix))
        .map(|(_, factory)| factory(suffix))
}

fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(bytes: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0_u32;
    for (index, byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            // Trailing bytes after the terminator are malformed.
            return (index + 1 == bytes.len()).then_some(value);
        }
        shift += 7;
    }
    None
}
