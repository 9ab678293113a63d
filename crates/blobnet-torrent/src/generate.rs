//! Metainfo generation for cached blobs.
//!
//! Piece length is picked from a size-bucketed table, piece hashes are
//! SHA-1 computed sequentially over the blob, and the resulting
//! canonical metainfo is persisted as the blob's `_torrent_meta`
//! sidecar.

use std::io::Read;

use sha1::{Digest as _, Sha1};
use tracing::debug;

use blobnet_metainfo::{Digest, Metainfo};
use blobnet_store::{CacheStore, Metadata};

use crate::error::{TorrentError, TorrentResult};

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// Sorted size-threshold to piece-length table.
#[derive(Debug, Clone)]
pub struct PieceLengthTable {
    entries: Vec<(u64, u64)>,
}

impl Default for PieceLengthTable {
    fn default() -> Self {
        Self {
            entries: vec![(0, MIB), (GIB, 4 * MIB), (4 * GIB, 8 * MIB)],
        }
    }
}

impl PieceLengthTable {
    /// Build a table from `(size threshold, piece length)` entries.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::Config`] when the table is empty or any
    /// piece length is zero.
    pub fn new(mut entries: Vec<(u64, u64)>) -> TorrentResult<Self> {
        if entries.is_empty() {
            return Err(TorrentError::Config {
                field: "piece_lengths",
                reason: "table must not be empty",
            });
        }
        if entries.iter().any(|(_, piece_length)| *piece_length == 0) {
            return Err(TorrentError::Config {
                field: "piece_lengths",
                reason: "piece length must be positive",
            });
        }
        entries.sort_by_key(|(threshold, _)| *threshold);
        Ok(Self { entries })
    }

    /// Piece length for a blob of `size`: the entry with the largest
    /// threshold not exceeding `size`, or the smallest entry's length
    /// when `size` is below every threshold.
    #[must_use]
    pub fn piece_length(&self, size: u64) -> u64 {
        self.entries
            .iter()
            .rev()
            .find(|(threshold, _)| *threshold <= size)
            .map_or(self.entries[0].1, |(_, piece_length)| *piece_length)
    }
}

/// Derives and persists metainfo for cached blobs.
#[derive(Debug, Clone, Default)]
pub struct MetainfoGenerator {
    table: PieceLengthTable,
}

impl MetainfoGenerator {
    /// Build a generator over `table`.
    #[must_use]
    pub const fn new(table: PieceLengthTable) -> Self {
        Self { table }
    }

    /// Generate metainfo for the cached blob `digest` and persist it as
    /// the blob's torrent-meta sidecar.
    ///
    /// # Errors
    ///
    /// Returns a store error when the blob is not cached, or an IO
    /// error when reading it fails.
    pub fn generate(&self, cache: &CacheStore, digest: &Digest) -> TorrentResult<Metainfo> {
        let name = digest.to_hex();
        let size = cache.get_cache_file_stat(&name)?.size;
        let piece_length = self.table.piece_length(size);

        let mut reader = cache.get_cache_file_reader(&name)?;
        let mut pieces = Vec::new();
        let mut chunk = vec![0_u8; usize::try_from(piece_length).unwrap_or(usize::MAX)];
        let mut hashed: u64 = 0;
        loop {
            let read = read_full(&mut reader, &mut chunk)
                .map_err(|e| TorrentError::io("generate.read", e))?;
            if read == 0 {
                break;
            }
            let hash: [u8; 20] = Sha1::digest(&chunk[..read]).into();
            pieces.extend_from_slice(&hash);
            hashed += read as u64;
        }
        if hashed != size {
            return Err(TorrentError::Inconsistent {
                digest: name,
                reason: "blob size changed while hashing",
            });
        }

        let metainfo = Metainfo::new(digest, size, piece_length, pieces)?;
        cache.set_cache_file_metadata(&name, &Metadata::TorrentMeta(metainfo.to_bytes()?))?;
        debug!(
            digest = %digest,
            size,
            piece_length,
            piece_count = metainfo.piece_count(),
            "generated torrent metainfo"
        );
        Ok(metainfo)
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobnet_store::{CasConfig, CasStore, PathPolicy};
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn table_buckets_by_size() -> anyhow::Result<()> {
        let table = PieceLengthTable::default();
        assert_eq!(table.piece_length(0), MIB);
        assert_eq!(table.piece_length(GIB - 1), MIB);
        assert_eq!(table.piece_length(GIB), 4 * MIB);
        assert_eq!(table.piece_length(10 * GIB), 8 * MIB);

        let table = PieceLengthTable::new(vec![(100, 8), (0, 4)])?;
        // Entries are sorted; below-all sizes use the smallest entry.
        assert_eq!(table.piece_length(5), 4);
        assert_eq!(table.piece_length(100), 8);
        Ok(())
    }

    #[test]
    fn empty_or_zero_tables_are_rejected() {
        assert!(matches!(
            PieceLengthTable::new(vec![]),
            Err(TorrentError::Config { .. })
        ));
        assert!(matches!(
            PieceLengthTable::new(vec![(0, 0)]),
            Err(TorrentError::Config { .. })
        ));
    }

    #[test]
    fn generated_metainfo_matches_the_blob() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let cas = CasStore::new(CasConfig::new(root.path()).with_policy(PathPolicy::Flat))?;
        let cache = cas.cache();

        let payload: Vec<u8> = (0_u8..=99).collect();
        let digest = Digest::compute(&payload);
        let name = digest.to_hex();
        cache.create_cache_file(&name, 0)?;
        let mut writer = cache.get_cache_file_read_writer(&name)?;
        writer.write_all(&payload)?;
        writer.commit()?;

        let generator = MetainfoGenerator::new(PieceLengthTable::new(vec![(0, 40)])?);
        let metainfo = generator.generate(&cache, &digest)?;

        assert_eq!(metainfo.length(), 100);
        assert_eq!(metainfo.piece_length(), 40);
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.piece_len(2)?, 20);
        let expected: [u8; 20] = Sha1::digest(&payload[..40]).into();
        assert_eq!(metainfo.piece_hash(0)?, expected);
        let tail: [u8; 20] = Sha1::digest(&payload[80..]).into();
        assert_eq!(metainfo.piece_hash(2)?, tail);

        // The sidecar round-trips to the same metainfo.
        let mut sidecar = Metadata::TorrentMeta(Vec::new());
        cache.get_cache_file_metadata(&name, &mut sidecar)?;
        let Metadata::TorrentMeta(bytes) = sidecar else {
            panic!("unexpected metadata kind");
        };
        assert_eq!(Metainfo::from_bytes(&bytes)?, metainfo);
        Ok(())
    }
}
