//! Piece-level read/write over one stored blob, with completion
//! signaling.
//!
//! A handle wraps the blob's file entry (via the download facade) and
//! its piece-status sidecar. Peers write hash-verified pieces
//! concurrently; the registry reads pieces whether the blob is still
//! downloading or already promoted. The last piece write promotes the
//! file from the download state to the cache and flips the completion
//! signal exactly once.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha1::{Digest as _, Sha1};
use tokio::sync::watch;
use tracing::{debug, warn};

use blobnet_metainfo::{Digest, Metainfo};
use blobnet_store::{DownloadStore, FileReader, Metadata, StoreError};

use crate::error::{TorrentError, TorrentResult};
use crate::piece::{PieceStatus, count_done};
use crate::Bitfield;

/// Piece-level view of one blob; cheap to share behind an `Arc`.
pub struct TorrentHandle {
    metainfo: Metainfo,
    digest: Digest,
    name: String,
    store: DownloadStore,
    read_only: bool,
    remaining: AtomicUsize,
    /// Serializes status-byte transitions so a late claim can never
    /// downgrade a piece that just went done. Data writes stay
    /// concurrent; only the short sidecar updates queue here.
    claim_lock: Mutex<()>,
    complete_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for TorrentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentHandle")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Outcome of attempting to claim a piece for writing.
enum Claim {
    AlreadyDone,
    Claimed,
    Conflict,
}

impl TorrentHandle {
    /// Build a writable handle, creating or resuming the download file.
    ///
    /// Resuming re-counts done pieces from the piece-status sidecar;
    /// a fully-done resume promotes immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::Exists`] when the blob is already cached
    /// under a conflicting entry, or a store error on IO failure.
    pub fn new_writable(store: DownloadStore, metainfo: Metainfo) -> TorrentResult<Self> {
        let digest = metainfo.digest()?;
        let name = digest.to_hex();
        match store.create_download_file(&name, metainfo.length()) {
            Ok(()) => {}
            // An earlier attempt left a resumable download file behind.
            Err(err) if err.is_exists() => {}
            Err(StoreError::FileState { .. }) => {
                return Err(TorrentError::Exists { digest: name });
            }
            Err(err) => return Err(err.into()),
        }
        store.set_download_file_metadata(&name, &Metadata::TorrentMeta(metainfo.to_bytes()?))?;

        let piece_count = metainfo.piece_count();
        let mut status = Metadata::PieceStatus(vec![PieceStatus::Empty.to_byte(); piece_count]);
        store.get_or_set_download_file_metadata(&name, &mut status)?;
        let Metadata::PieceStatus(bytes) = status else {
            unreachable!("get_or_set preserves the metadata kind");
        };
        let done = count_done(&bytes);

        let handle = Self {
            metainfo,
            digest,
            name,
            store,
            read_only: false,
            remaining: AtomicUsize::new(piece_count - done),
            claim_lock: Mutex::new(()),
            complete_tx: watch::channel(false).0,
        };
        if handle.remaining.load(Ordering::SeqCst) == 0 {
            handle.finalize()?;
        }
        Ok(handle)
    }

    /// Build a read-only origin handle over an already-complete blob.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::Inconsistent`] when the stored blob's
    /// size disagrees with the metainfo.
    pub fn new_origin(store: DownloadStore, metainfo: Metainfo) -> TorrentResult<Self> {
        let digest = metainfo.digest()?;
        let name = digest.to_hex();
        let stat = store.get_download_or_cache_file_stat(&name)?;
        if stat.size != metainfo.length() {
            return Err(TorrentError::Inconsistent {
                digest: name,
                reason: "size disagrees with metainfo",
            });
        }
        Ok(Self {
            metainfo,
            digest,
            name,
            store,
            read_only: true,
            remaining: AtomicUsize::new(0),
            claim_lock: Mutex::new(()),
            complete_tx: watch::channel(true).0,
        })
    }

    /// The blob's content digest.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.digest
    }

    /// The torrent's metainfo.
    #[must_use]
    pub const fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    /// Number of pieces.
    #[must_use]
    pub fn num_pieces(&self) -> usize {
        self.metainfo.piece_count()
    }

    /// Length of piece `index`.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::PieceOutOfRange`] for invalid indices.
    pub fn piece_length(&self, index: usize) -> TorrentResult<u64> {
        self.metainfo
            .piece_len(index)
            .map_err(|_| self.out_of_range(index))
    }

    /// Write one hash-verified piece at its offset; the final piece
    /// promotes the blob into the cache and signals completion.
    ///
    /// Writes to already-done pieces are idempotent successes.
    ///
    /// # Errors
    ///
    /// - [`TorrentError::ReadOnly`] on an origin handle.
    /// - [`TorrentError::PieceOutOfRange`] / [`TorrentError::PieceSize`]
    ///   / [`TorrentError::HashMismatch`] on invalid input.
    /// - [`TorrentError::PieceConflict`] when another writer holds the
    ///   piece.
    pub fn write_piece(&self, data: &[u8], index: usize) -> TorrentResult<()> {
        if self.read_only {
            return Err(TorrentError::ReadOnly {
                digest: self.name.clone(),
            });
        }
        let expected_len = self.piece_length(index)?;
        if data.len() as u64 != expected_len {
            return Err(TorrentError::PieceSize {
                piece: index,
                expected: expected_len,
                actual: data.len() as u64,
            });
        }
        let hash: [u8; 20] = Sha1::digest(data).into();
        if hash != self.metainfo.piece_hash(index)? {
            return Err(TorrentError::HashMismatch { piece: index });
        }

        match self.try_claim(index)? {
            Claim::AlreadyDone => return Ok(()),
            Claim::Conflict => return Err(TorrentError::PieceConflict { piece: index }),
            Claim::Claimed => {}
        }

        let offset = index as u64 * self.metainfo.piece_length();
        let write = self
            .store
            .get_download_file_read_writer(&self.name)
            .map_err(TorrentError::from)
            .and_then(|writer| {
                writer
                    .write_at(data, offset)
                    .map_err(|e| TorrentError::io("write_piece", e))
            });
        if let Err(err) = write {
            self.release_piece(index);
            return Err(err);
        }

        self.set_status(index, PieceStatus::Done)?;
        debug!(digest = %self.digest, piece = index, "piece written");

        // Checked decrement: a claim that raced an already-done piece
        // must not drive the counter below zero.
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            });
        if previous == Ok(1) {
            self.finalize()?;
        }
        Ok(())
    }

    /// Open a reader positioned at piece `index`; readable whether the
    /// blob is still downloading or already cached.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::PieceOutOfRange`] for invalid indices.
    pub fn get_piece_reader(&self, index: usize) -> TorrentResult<PieceReader> {
        let len = self.piece_length(index)?;
        let reader = self.store.get_download_or_cache_file_reader(&self.name)?;
        Ok(PieceReader {
            reader,
            offset: index as u64 * self.metainfo.piece_length(),
            len,
            pos: 0,
        })
    }

    /// Whether piece `index` is done.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::PieceOutOfRange`] for invalid indices.
    pub fn has_piece(&self, index: usize) -> TorrentResult<bool> {
        Ok(self.piece_status(index)? == PieceStatus::Done)
    }

    /// Indices of pieces not yet done.
    ///
    /// # Errors
    ///
    /// Returns a store error when the status sidecar is unreadable.
    pub fn missing_pieces(&self) -> TorrentResult<Vec<usize>> {
        let bitfield = self.bitfield()?;
        Ok(bitfield
            .iter()
            .enumerate()
            .filter(|(_, has)| !**has)
            .map(|(index, _)| index)
            .collect())
    }

    /// Piece availability, one bit per piece.
    ///
    /// # Errors
    ///
    /// Returns a store error when the status sidecar is unreadable.
    pub fn bitfield(&self) -> TorrentResult<Bitfield> {
        if self.read_only {
            return Ok(Bitfield::repeat(true, self.num_pieces()));
        }
        let status = self.status_array()?;
        let mut bitfield = Bitfield::repeat(false, self.num_pieces());
        for (index, byte) in status.iter().enumerate() {
            if *byte == PieceStatus::Done.to_byte() {
                bitfield.set(index, true);
            }
        }
        Ok(bitfield)
    }

    /// Whether every piece is done.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }

    /// Total bytes of done pieces.
    ///
    /// # Errors
    ///
    /// Returns a store error when the status sidecar is unreadable.
    pub fn bytes_downloaded(&self) -> TorrentResult<u64> {
        if self.read_only {
            return Ok(self.metainfo.length());
        }
        let status = self.status_array()?;
        let mut bytes = 0;
        for (index, byte) in status.iter().enumerate() {
            if *byte == PieceStatus::Done.to_byte() {
                bytes += self.piece_length(index)?;
            }
        }
        Ok(bytes)
    }

    /// Subscribe to the completion signal; the value flips to `true`
    /// exactly once.
    #[must_use]
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.complete_tx.subscribe()
    }

    /// Wait for completion with a deadline; `false` on timeout. On
    /// timeout the caller drops the handle — written pieces stay done
    /// and resume on the next attempt.
    pub async fn wait_complete(&self, timeout: Duration) -> bool {
        let mut receiver = self.completion();
        match tokio::time::timeout(timeout, receiver.wait_for(|done| *done)).await {
            Ok(result) => result.is_ok() || self.complete(),
            Err(_elapsed) => false,
        }
    }

    /// Attempt the empty/clean to dirty transition for piece `index`.
    ///
    /// The compare-and-write on the status byte is the cross-process
    /// guard; the claim mutex additionally serializes in-process
    /// transitions so done is never downgraded.
    fn try_claim(&self, index: usize) -> TorrentResult<Claim> {
        let _guard = self.lock_claims();
        match self.piece_status(index)? {
            PieceStatus::Done => Ok(Claim::AlreadyDone),
            PieceStatus::Dirty => Ok(Claim::Conflict),
            PieceStatus::Empty | PieceStatus::Clean => {
                let claimed = self.store.set_download_file_metadata_at(
                    &self.name,
                    &status_key(),
                    &[PieceStatus::Dirty.to_byte()],
                    index as u64,
                )?;
                if claimed {
                    Ok(Claim::Claimed)
                } else {
                    Ok(Claim::Conflict)
                }
            }
        }
    }

    fn set_status(&self, index: usize, status: PieceStatus) -> TorrentResult<()> {
        let _guard = self.lock_claims();
        self.store.set_download_file_metadata_at(
            &self.name,
            &status_key(),
            &[status.to_byte()],
            index as u64,
        )?;
        Ok(())
    }

    fn lock_claims(&self) -> MutexGuard<'_, ()> {
        self.claim_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn piece_status(&self, index: usize) -> TorrentResult<PieceStatus> {
        if index >= self.num_pieces() {
            return Err(self.out_of_range(index));
        }
        if self.read_only {
            return Ok(PieceStatus::Done);
        }
        let status = self.status_array()?;
        let byte = status.get(index).copied().ok_or_else(|| {
            TorrentError::Inconsistent {
                digest: self.name.clone(),
                reason: "piece status shorter than piece count",
            }
        })?;
        PieceStatus::from_byte(index, byte)
    }

    fn status_array(&self) -> TorrentResult<Vec<u8>> {
        let mut status = status_key();
        self.store
            .get_download_file_metadata(&self.name, &mut status)?;
        let Metadata::PieceStatus(bytes) = status else {
            unreachable!("get_metadata preserves the metadata kind");
        };
        Ok(bytes)
    }

    fn release_piece(&self, index: usize) {
        if let Err(err) = self.set_status(index, PieceStatus::Clean) {
            warn!(
                digest = %self.digest,
                piece = index,
                error = %err,
                "failed to release piece after write failure"
            );
        }
    }

    fn finalize(&self) -> TorrentResult<()> {
        self.store.move_download_file_to_cache(&self.name)?;
        self.complete_tx.send_replace(true);
        debug!(digest = %self.digest, "torrent complete, blob promoted to cache");
        Ok(())
    }

    fn out_of_range(&self, index: usize) -> TorrentError {
        TorrentError::PieceOutOfRange {
            piece: index,
            piece_count: self.num_pieces(),
        }
    }
}

fn status_key() -> Metadata {
    Metadata::PieceStatus(Vec::new())
}

/// Reader over one piece's byte range; valid across promotion and even
/// after the underlying file is evicted (the descriptor is owned).
pub struct PieceReader {
    reader: FileReader,
    offset: u64,
    len: u64,
    pos: u64,
}

impl PieceReader {
    /// The piece's length in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// True when the piece is zero-length.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for PieceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.pos;
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = self.reader.read_at(&mut buf[..want], self.offset + self.pos)?;
        self.pos += read as u64;
        Ok(read)
    }
}
