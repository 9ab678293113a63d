//! Registry of active torrents keyed by content digest.
//!
//! The archive hands out shared [`TorrentHandle`]s: writable handles for
//! blobs being fetched from the swarm, read-only origin handles for
//! blobs already cached. Metainfo for new downloads comes through the
//! [`MetainfoSource`] seam (the tracker client lives outside the core);
//! a full miss schedules a deduplicated backend refresh and reports
//! not-found.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use blobnet_metainfo::{Digest, Metainfo, PIECE_HASH_LEN};
use blobnet_store::{CasStore, Metadata, StoreError};

use crate::Bitfield;
use crate::error::{TorrentError, TorrentResult};
use crate::generate::MetainfoGenerator;
use crate::handle::TorrentHandle;
use crate::refresh::BlobRefresher;

/// Resolves metainfo for blobs the agent is asked to download.
#[async_trait]
pub trait MetainfoSource: Send + Sync {
    /// Fetch the metainfo describing `digest` within `namespace`.
    async fn fetch(&self, namespace: &str, digest: &Digest) -> TorrentResult<Metainfo>;
}

/// Snapshot of one torrent's identity and progress.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Content digest of the blob.
    pub digest: Digest,
    /// SHA-1 of the bencoded info dictionary.
    pub info_hash: [u8; PIECE_HASH_LEN],
    /// Piece availability, one bit per piece.
    pub bitfield: Bitfield,
    /// Completed share of the blob, 0 to 100.
    pub percent_downloaded: u8,
}

/// Digest-keyed registry of active torrent handles.
pub struct TorrentArchive {
    cas: CasStore,
    source: Arc<dyn MetainfoSource>,
    refresher: Arc<BlobRefresher>,
    generator: MetainfoGenerator,
    handles: Mutex<HashMap<String, Arc<TorrentHandle>>>,
}

impl TorrentArchive {
    /// Build an archive over the store, metainfo seam and refresher.
    #[must_use]
    pub fn new(
        cas: CasStore,
        source: Arc<dyn MetainfoSource>,
        refresher: Arc<BlobRefresher>,
        generator: MetainfoGenerator,
    ) -> Self {
        Self {
            cas,
            source,
            refresher,
            generator,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Build a writable handle for a new blob download.
    ///
    /// Idempotent per digest: an active handle is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::Exists`] when the blob is already a
    /// cached file.
    pub async fn create(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> TorrentResult<Arc<TorrentHandle>> {
        let name = digest.to_hex();
        if let Some(handle) = self.handle(&name) {
            return Ok(handle);
        }
        if self.cas.cache().get_cache_file_stat(&name).is_ok() {
            return Err(TorrentError::Exists { digest: name });
        }
        let metainfo = self.source.fetch(namespace, digest).await?;
        let handle = Arc::new(TorrentHandle::new_writable(self.cas.download(), metainfo)?);
        debug!(digest = %name, pieces = handle.num_pieces(), "created writable torrent");
        Ok(self.insert(name, handle))
    }

    /// Look up the torrent for `digest`.
    ///
    /// Resolution order: active handle, cached blob (origin handle,
    /// generating metainfo when the sidecar is missing), resumable
    /// download staging, and finally a scheduled backend refresh with
    /// [`TorrentError::NotFound`] returned to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::NotFound`] when the blob is neither
    /// active nor stored locally.
    pub async fn get(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> TorrentResult<Arc<TorrentHandle>> {
        let name = digest.to_hex();
        if let Some(handle) = self.handle(&name) {
            return Ok(handle);
        }

        if self.cas.cache().get_cache_file_stat(&name).is_ok() {
            let metainfo = self.cached_metainfo(&name, digest)?;
            let handle = Arc::new(TorrentHandle::new_origin(self.cas.download(), metainfo)?);
            debug!(digest = %name, "opened origin torrent over cached blob");
            return Ok(self.insert(name, handle));
        }

        let mut sidecar = Metadata::TorrentMeta(Vec::new());
        if self
            .cas
            .download()
            .get_download_file_metadata(&name, &mut sidecar)
            .is_ok()
        {
            let Metadata::TorrentMeta(bytes) = sidecar else {
                unreachable!("get_metadata preserves the metadata kind");
            };
            let metainfo = Metainfo::from_bytes(&bytes)?;
            let handle = Arc::new(TorrentHandle::new_writable(self.cas.download(), metainfo)?);
            debug!(digest = %name, "resumed torrent from download staging");
            return Ok(self.insert(name, handle));
        }

        self.refresher.refresh(namespace, digest);
        Err(TorrentError::NotFound { digest: name })
    }

    /// Identity and progress for `digest`, without opening readers.
    ///
    /// # Errors
    ///
    /// Same contract as [`TorrentArchive::get`].
    pub async fn stat(&self, namespace: &str, digest: &Digest) -> TorrentResult<TorrentInfo> {
        let handle = self.get(namespace, digest).await?;
        Self::snapshot(&handle)
    }

    /// Forget the torrent and remove the underlying local files.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::Store`] wrapping `FilePersisted` when a
    /// persist sidecar blocks deletion; the handle then stays
    /// registered.
    pub fn delete(&self, digest: &Digest) -> TorrentResult<()> {
        let name = digest.to_hex();
        // The blob lives in exactly one state; each facade skips the
        // state it does not hold.
        match self.cas.cache().delete_cache_file(&name) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(StoreError::FileState { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        match self.cas.download().delete_download_file(&name) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(StoreError::FileState { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.lock_handles().remove(&name);
        debug!(digest = %name, "torrent deleted");
        Ok(())
    }

    /// Number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_handles().len()
    }

    /// True when no handles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(handle: &TorrentHandle) -> TorrentResult<TorrentInfo> {
        let bitfield = handle.bitfield()?;
        let length = handle.metainfo().length();
        let percent = if length == 0 {
            100
        } else {
            u8::try_from(handle.bytes_downloaded()? * 100 / length).unwrap_or(100)
        };
        Ok(TorrentInfo {
            digest: *handle.digest(),
            info_hash: handle.metainfo().info_hash()?,
            bitfield,
            percent_downloaded: percent,
        })
    }

    fn cached_metainfo(&self, name: &str, digest: &Digest) -> TorrentResult<Metainfo> {
        let mut sidecar = Metadata::TorrentMeta(Vec::new());
        match self.cas.cache().get_cache_file_metadata(name, &mut sidecar) {
            Ok(()) => {
                let Metadata::TorrentMeta(bytes) = sidecar else {
                    unreachable!("get_metadata preserves the metadata kind");
                };
                Ok(Metainfo::from_bytes(&bytes)?)
            }
            // A blob seeded without metainfo (e.g. pushed through the
            // registry) gets its sidecar generated on first reference.
            Err(err) if err.is_not_found() => self.generator.generate(&self.cas.cache(), digest),
            Err(err) => Err(err.into()),
        }
    }

    fn handle(&self, name: &str) -> Option<Arc<TorrentHandle>> {
        self.lock_handles().get(name).cloned()
    }

    fn insert(&self, name: String, handle: Arc<TorrentHandle>) -> Arc<TorrentHandle> {
        let mut handles = self.lock_handles();
        // A racing resolver may have registered first; its handle wins.
        Arc::clone(handles.entry(name).or_insert(handle))
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<String, Arc<TorrentHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
