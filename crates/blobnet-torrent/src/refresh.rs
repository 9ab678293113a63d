//! Asynchronous re-population of missing blobs from their backends.
//!
//! A cache miss on `get`/`stat` schedules a refresh job: download the
//! blob into the download state, promote it to the cache, then generate
//! its torrent metainfo so the next `get` can serve an origin handle.
//! Concurrent requests for the same digest are deduplicated.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use blobnet_backend::BackendManager;
use blobnet_metainfo::Digest;
use blobnet_store::CasStore;

use crate::error::{TorrentError, TorrentResult};
use crate::generate::MetainfoGenerator;

/// Deduplicating background blob refresher.
pub struct BlobRefresher {
    manager: Arc<BackendManager>,
    cas: CasStore,
    generator: MetainfoGenerator,
    pending: Mutex<HashSet<String>>,
}

impl BlobRefresher {
    /// Build a refresher over the backend routing table.
    #[must_use]
    pub fn new(manager: Arc<BackendManager>, cas: CasStore, generator: MetainfoGenerator) -> Self {
        Self {
            manager,
            cas,
            generator,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Schedule a refresh of `digest` from `namespace`'s backend;
    /// duplicate requests while one is in flight are dropped.
    pub fn refresh(self: &Arc<Self>, namespace: &str, digest: &Digest) {
        let name = digest.to_hex();
        {
            let mut pending = self.lock_pending();
            if !pending.insert(name.clone()) {
                debug!(digest = %name, "blob refresh already in flight");
                return;
            }
        }
        let this = Arc::clone(self);
        let namespace = namespace.to_string();
        let digest = *digest;
        tokio::spawn(async move {
            if let Err(err) = this.run(&namespace, &digest).await {
                warn!(
                    namespace = %namespace,
                    digest = %digest,
                    error = %err,
                    "blob refresh failed"
                );
            }
            this.lock_pending().remove(&digest.to_hex());
        });
    }

    /// Number of refreshes currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock_pending().len()
    }

    async fn run(&self, namespace: &str, digest: &Digest) -> TorrentResult<()> {
        let name = digest.to_hex();
        let cache = self.cas.cache();
        if cache.get_cache_file_stat(&name).is_ok() {
            debug!(digest = %name, "blob already cached, refresh is a no-op");
            return Ok(());
        }

        let client = self.manager.get_client(namespace)?;
        let info = client.stat(namespace, &name).await?;

        let download = self.cas.download();
        match download.create_download_file(&name, info.size) {
            Ok(()) => {}
            // A dead earlier attempt left the staging file; overwrite it.
            Err(err) if err.is_exists() => {}
            Err(err) => return Err(err.into()),
        }
        let mut writer = download.get_download_file_read_writer(&name)?;
        let written = self.manager.download(namespace, &name, &mut writer).await?;
        writer
            .commit()
            .map_err(|e| TorrentError::io("refresh.commit", e))?;
        if written != info.size {
            return Err(TorrentError::Inconsistent {
                digest: name,
                reason: "backend returned fewer bytes than stat reported",
            });
        }

        download.move_download_file_to_cache(&name)?;
        self.generator.generate(&cache, digest)?;
        debug!(digest = %name, size = info.size, "blob refreshed from backend");
        Ok(())
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
