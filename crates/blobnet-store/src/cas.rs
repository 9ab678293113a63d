//! Content-addressable store roots and the typed state facades.
//!
//! [`CasStore`] owns the `upload/`, `download/` and `cache/` directories
//! under one root and a single shared file map. The three facades pin a
//! [`FileOp`](crate::store::FileOp) to the states their role may touch:
//! cache only, upload→cache, and download→cache. The two
//! `move_*_to_cache` promotions are the only paths into the cache state;
//! both treat an existing cache copy as success and discard the staging
//! source.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::entry::{FileReadWriter, FileReader, FileStat};
use crate::error::{StoreError, StoreResult};
use crate::map::{DEFAULT_LAT_RESOLUTION, FileMap};
use crate::metadata::Metadata;
use crate::path::{FileState, PathPolicy};
use crate::store::{FileOp, FileStore};

/// Configuration for a [`CasStore`].
#[derive(Debug, Clone)]
pub struct CasConfig {
    /// Root directory; the three state directories are created below it.
    pub root: PathBuf,
    /// Path policy shared by all states.
    pub policy: PathPolicy,
    /// Cache cardinality limit; `None` disables eviction.
    pub capacity: Option<usize>,
    /// Last-access-time write throttle.
    pub lat_resolution: Duration,
}

impl CasConfig {
    /// Defaults: sharded layout, no capacity cap, 5 minute LAT throttle.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: PathPolicy::default(),
            capacity: None,
            lat_resolution: DEFAULT_LAT_RESOLUTION,
        }
    }

    /// Cap the store at `capacity` cached entries.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Override the path policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PathPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the LAT write throttle.
    #[must_use]
    pub const fn with_lat_resolution(mut self, resolution: Duration) -> Self {
        self.lat_resolution = resolution;
        self
    }
}

/// Content-addressable store: one file store, three states.
#[derive(Clone)]
pub struct CasStore {
    store: Arc<FileStore>,
    upload: FileState,
    download: FileState,
    cache: FileState,
}

impl CasStore {
    /// Build the state directories and the shared map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when a state directory cannot be
    /// created, or [`StoreError::Config`] on an invalid capacity.
    pub fn new(config: CasConfig) -> StoreResult<Self> {
        let upload = FileState::new(config.root.join("upload"));
        let download = FileState::new(config.root.join("download"));
        let cache = FileState::new(config.root.join("cache"));
        for state in [&upload, &download, &cache] {
            std::fs::create_dir_all(state.dir())
                .map_err(|e| StoreError::io("cas.mkdir", state.dir(), e))?;
        }
        let map = match config.capacity {
            Some(capacity) => FileMap::new_lru(capacity, config.lat_resolution)?,
            None => FileMap::new_lat(config.lat_resolution),
        };
        Ok(Self {
            store: Arc::new(FileStore::new(config.policy, map)),
            upload,
            download,
            cache,
        })
    }

    /// The cache facade.
    #[must_use]
    pub fn cache(&self) -> CacheStore {
        CacheStore {
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
        }
    }

    /// The upload-staging facade.
    #[must_use]
    pub fn upload(&self) -> UploadStore {
        UploadStore {
            store: Arc::clone(&self.store),
            upload: self.upload.clone(),
            cache: self.cache.clone(),
        }
    }

    /// The download-staging facade.
    #[must_use]
    pub fn download(&self) -> DownloadStore {
        DownloadStore {
            store: Arc::clone(&self.store),
            download: self.download.clone(),
            cache: self.cache.clone(),
        }
    }
}

/// Typed wrapper over the cache state.
#[derive(Clone)]
pub struct CacheStore {
    store: Arc<FileStore>,
    cache: FileState,
}

impl CacheStore {
    fn op(&self) -> FileOp<'_> {
        self.store.op().accept_state(&self.cache)
    }

    /// Create a cache file directly; used by tests and seeding tools.
    ///
    /// # Errors
    ///
    /// See [`FileOp::create_file`].
    pub fn create_cache_file(&self, name: &str, len: u64) -> StoreResult<()> {
        self.op().create_file(name, &self.cache, len)
    }

    /// Open a reader on a cached blob.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_reader`].
    pub fn get_cache_file_reader(&self, name: &str) -> StoreResult<FileReader> {
        self.op().get_file_reader(name)
    }

    /// Open a read-writer on a cached blob; used to seed fixtures.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_read_writer`].
    pub fn get_cache_file_read_writer(&self, name: &str) -> StoreResult<FileReadWriter> {
        self.op().get_file_read_writer(name)
    }

    /// Stat a cached blob.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_stat`].
    pub fn get_cache_file_stat(&self, name: &str) -> StoreResult<FileStat> {
        self.op().get_file_stat(name)
    }

    /// Absolute data path of a cached blob.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_path`].
    pub fn get_cache_file_path(&self, name: &str) -> StoreResult<PathBuf> {
        self.op().get_file_path(name)
    }

    /// Hard-link a cached blob to an external path.
    ///
    /// # Errors
    ///
    /// See [`FileOp::link_file_to`].
    pub fn link_cache_file_to(&self, name: &str, target: &std::path::Path) -> StoreResult<()> {
        self.op().link_file_to(name, target)
    }

    /// Delete a cached blob; honors the persist sidecar.
    ///
    /// # Errors
    ///
    /// See [`FileOp::delete_file`].
    pub fn delete_cache_file(&self, name: &str) -> StoreResult<()> {
        self.op().delete_file(name)
    }

    /// Fill `md` from a cached blob's sidecar.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_metadata`].
    pub fn get_cache_file_metadata(&self, name: &str, md: &mut Metadata) -> StoreResult<()> {
        self.op().get_file_metadata(name, md)
    }

    /// Write a cached blob's sidecar.
    ///
    /// # Errors
    ///
    /// See [`FileOp::set_file_metadata`].
    pub fn set_cache_file_metadata(&self, name: &str, md: &Metadata) -> StoreResult<bool> {
        self.op().set_file_metadata(name, md)
    }

    /// Initialize-or-read a cached blob's sidecar.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_or_set_file_metadata`].
    pub fn get_or_set_cache_file_metadata(
        &self,
        name: &str,
        md: &mut Metadata,
    ) -> StoreResult<bool> {
        self.op().get_or_set_file_metadata(name, md)
    }

    /// Visit a cached blob's sidecars.
    ///
    /// # Errors
    ///
    /// See [`FileOp::range_file_metadata`].
    pub fn range_cache_file_metadata(
        &self,
        name: &str,
        visit: impl FnMut(&Metadata) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        self.op().range_file_metadata(name, visit)
    }

    /// Sorted names of all cached blobs.
    ///
    /// # Errors
    ///
    /// See [`FileOp::list_names`].
    pub fn list_cache_names(&self) -> StoreResult<Vec<String>> {
        self.op().list_names()
    }

    /// Increment a cached blob's reference count.
    ///
    /// # Errors
    ///
    /// See [`FileOp::increment_file_ref_count`].
    pub fn increment_cache_file_ref_count(&self, name: &str) -> StoreResult<u64> {
        self.op().increment_file_ref_count(name)
    }

    /// Decrement a cached blob's reference count, saturating at zero.
    ///
    /// # Errors
    ///
    /// See [`FileOp::decrement_file_ref_count`].
    pub fn decrement_cache_file_ref_count(&self, name: &str) -> StoreResult<u64> {
        self.op().decrement_file_ref_count(name)
    }
}

/// Typed wrapper over the upload-staging and cache states.
#[derive(Clone)]
pub struct UploadStore {
    store: Arc<FileStore>,
    upload: FileState,
    cache: FileState,
}

impl UploadStore {
    fn staging_op(&self) -> FileOp<'_> {
        self.store.op().accept_state(&self.upload)
    }

    fn promote_op(&self) -> FileOp<'_> {
        self.store
            .op()
            .accept_state(&self.upload)
            .accept_state(&self.cache)
    }

    /// Create an upload-staging file.
    ///
    /// # Errors
    ///
    /// See [`FileOp::create_file`].
    pub fn create_upload_file(&self, name: &str, len: u64) -> StoreResult<()> {
        self.staging_op().create_file(name, &self.upload, len)
    }

    /// Ingest an unmanaged temp file as an upload.
    ///
    /// # Errors
    ///
    /// See [`FileOp::move_file_from`].
    pub fn move_upload_file_from(&self, name: &str, source: &std::path::Path) -> StoreResult<()> {
        self.staging_op().move_file_from(name, &self.upload, source)
    }

    /// Open a read-writer used by the registry's chunked upload protocol.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_read_writer`].
    pub fn get_upload_file_read_writer(&self, name: &str) -> StoreResult<FileReadWriter> {
        self.staging_op().get_file_read_writer(name)
    }

    /// Stat an upload-staging file.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_stat`].
    pub fn get_upload_file_stat(&self, name: &str) -> StoreResult<FileStat> {
        self.staging_op().get_file_stat(name)
    }

    /// Fill `md` from an upload's sidecar (start time, hasher state).
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_metadata`].
    pub fn get_upload_file_metadata(&self, name: &str, md: &mut Metadata) -> StoreResult<()> {
        self.staging_op().get_file_metadata(name, md)
    }

    /// Write an upload's sidecar.
    ///
    /// # Errors
    ///
    /// See [`FileOp::set_file_metadata`].
    pub fn set_upload_file_metadata(&self, name: &str, md: &Metadata) -> StoreResult<bool> {
        self.staging_op().set_file_metadata(name, md)
    }

    /// Delete an abandoned upload.
    ///
    /// # Errors
    ///
    /// See [`FileOp::delete_file`].
    pub fn delete_upload_file(&self, name: &str) -> StoreResult<()> {
        self.staging_op().delete_file(name)
    }

    /// Promote a finished upload into the cache.
    ///
    /// Idempotent: when the cache already holds `name`, the staging copy
    /// is discarded and the promotion reports success.
    ///
    /// # Errors
    ///
    /// Propagates non-`Exists` promotion failures.
    pub fn move_upload_file_to_cache(&self, name: &str) -> StoreResult<()> {
        promote_to_cache(&self.promote_op(), &self.staging_op(), name, &self.cache)
    }
}

/// Typed wrapper over the download-staging and cache states.
#[derive(Clone)]
pub struct DownloadStore {
    store: Arc<FileStore>,
    download: FileState,
    cache: FileState,
}

impl DownloadStore {
    fn staging_op(&self) -> FileOp<'_> {
        self.store.op().accept_state(&self.download)
    }

    fn spanning_op(&self) -> FileOp<'_> {
        self.store
            .op()
            .accept_state(&self.download)
            .accept_state(&self.cache)
    }

    /// Create a download-staging file pre-sized to `len`.
    ///
    /// # Errors
    ///
    /// See [`FileOp::create_file`].
    pub fn create_download_file(&self, name: &str, len: u64) -> StoreResult<()> {
        self.staging_op().create_file(name, &self.download, len)
    }

    /// Open a read-writer for piece writes; download state only.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_read_writer`].
    pub fn get_download_file_read_writer(&self, name: &str) -> StoreResult<FileReadWriter> {
        self.staging_op().get_file_read_writer(name)
    }

    /// Open a reader that works while downloading and after promotion.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_reader`].
    pub fn get_download_or_cache_file_reader(&self, name: &str) -> StoreResult<FileReader> {
        self.spanning_op().get_file_reader(name)
    }

    /// Stat the blob in either staging or cache.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_stat`].
    pub fn get_download_or_cache_file_stat(&self, name: &str) -> StoreResult<FileStat> {
        self.spanning_op().get_file_stat(name)
    }

    /// Fill `md` from a sidecar in either staging or cache.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_file_metadata`].
    pub fn get_download_file_metadata(&self, name: &str, md: &mut Metadata) -> StoreResult<()> {
        self.spanning_op().get_file_metadata(name, md)
    }

    /// Write a sidecar in either staging or cache.
    ///
    /// # Errors
    ///
    /// See [`FileOp::set_file_metadata`].
    pub fn set_download_file_metadata(&self, name: &str, md: &Metadata) -> StoreResult<bool> {
        self.spanning_op().set_file_metadata(name, md)
    }

    /// Compare-and-write one sidecar region; backs the piece state
    /// machine's single-writer claims.
    ///
    /// # Errors
    ///
    /// See [`FileOp::set_file_metadata_at`].
    pub fn set_download_file_metadata_at(
        &self,
        name: &str,
        md: &Metadata,
        bytes: &[u8],
        offset: u64,
    ) -> StoreResult<bool> {
        self.spanning_op().set_file_metadata_at(name, md, bytes, offset)
    }

    /// Initialize-or-read a sidecar in either staging or cache.
    ///
    /// # Errors
    ///
    /// See [`FileOp::get_or_set_file_metadata`].
    pub fn get_or_set_download_file_metadata(
        &self,
        name: &str,
        md: &mut Metadata,
    ) -> StoreResult<bool> {
        self.spanning_op().get_or_set_file_metadata(name, md)
    }

    /// Delete an abandoned download.
    ///
    /// # Errors
    ///
    /// See [`FileOp::delete_file`].
    pub fn delete_download_file(&self, name: &str) -> StoreResult<()> {
        self.staging_op().delete_file(name)
    }

    /// Promote a completed download into the cache.
    ///
    /// Idempotent: when the cache already holds `name`, the staging copy
    /// is discarded and the promotion reports success.
    ///
    /// # Errors
    ///
    /// Propagates non-`Exists` promotion failures.
    pub fn move_download_file_to_cache(&self, name: &str) -> StoreResult<()> {
        promote_to_cache(&self.spanning_op(), &self.staging_op(), name, &self.cache)
    }
}

/// Shared promotion plumbing: move into cache, absorbing `Exists` by
/// discarding the staging copy.
fn promote_to_cache(
    promote: &FileOp<'_>,
    staging: &FileOp<'_>,
    name: &str,
    cache: &FileState,
) -> StoreResult<()> {
    match promote.move_file(name, cache) {
        Ok(()) => Ok(()),
        Err(err) if err.is_exists() => {
            // The cache copy wins; drop the staging duplicate if one is
            // still around. A state mismatch here just means the entry
            // already is the cache copy.
            match staging.delete_file(name) {
                Ok(()) => debug!(name = %name, "discarded staging duplicate"),
                Err(discard_err) => debug!(
                    name = %name,
                    error = %discard_err,
                    "no staging duplicate to discard"
                ),
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use tempfile::TempDir;

    fn cas() -> (TempDir, CasStore) {
        let root = TempDir::new().expect("temp root");
        let store =
            CasStore::new(CasConfig::new(root.path()).with_policy(PathPolicy::Flat)).expect("cas");
        (root, store)
    }

    #[test]
    fn upload_promotion_reaches_the_cache() -> anyhow::Result<()> {
        let (_root, cas) = cas();
        let upload = cas.upload();
        upload.create_upload_file("blob", 0)?;
        let mut writer = upload.get_upload_file_read_writer("blob")?;
        writer.write_at(b"content", 0)?;
        writer.commit()?;
        upload.move_upload_file_to_cache("blob")?;

        let mut reader = cas.cache().get_cache_file_reader("blob")?;
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        assert_eq!(buf, "content");
        Ok(())
    }

    #[test]
    fn duplicate_promotion_is_idempotent() -> anyhow::Result<()> {
        let (_root, cas) = cas();
        let upload = cas.upload();
        upload.create_upload_file("blob", 3)?;
        upload.move_upload_file_to_cache("blob")?;
        // Promoting again (entry now lives in cache) still succeeds.
        upload.move_upload_file_to_cache("blob")?;
        assert_eq!(cas.cache().get_cache_file_stat("blob")?.size, 3);
        Ok(())
    }

    #[test]
    fn competing_upload_is_discarded() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let config = CasConfig::new(root.path()).with_policy(PathPolicy::Flat);

        // Another process already cached the blob.
        let other = CasStore::new(config.clone())?;
        let mut writer = {
            other.cache().create_cache_file("blob", 0)?;
            other.cache().get_cache_file_read_writer("blob")?
        };
        writer.write_at(b"winner", 0)?;
        writer.commit()?;

        // This process stages the same digest, unaware of the cache copy.
        let cas = CasStore::new(config)?;
        let upload = cas.upload();
        upload.create_upload_file("blob", 6)?;
        upload.move_upload_file_to_cache("blob")?;

        // The original cache copy wins and the staging copy is gone.
        let mut reader = cas.cache().get_cache_file_reader("blob")?;
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        assert_eq!(buf, "winner");
        assert!(
            upload
                .get_upload_file_stat("blob")
                .unwrap_err()
                .is_not_found()
        );
        Ok(())
    }

    #[test]
    fn download_metadata_spans_promotion() -> anyhow::Result<()> {
        let (_root, cas) = cas();
        let download = cas.download();
        download.create_download_file("blob", 4)?;
        let mut status = Metadata::PieceStatus(vec![0, 0]);
        assert!(download.get_or_set_download_file_metadata("blob", &mut status)?);

        download.move_download_file_to_cache("blob")?;

        // The piece-status sidecar is movable and still reachable through
        // the download facade after promotion.
        let mut reloaded = Metadata::PieceStatus(Vec::new());
        download.get_download_file_metadata("blob", &mut reloaded)?;
        assert_eq!(reloaded, Metadata::PieceStatus(vec![0, 0]));

        // Staging-only ops now reject the promoted blob.
        assert!(matches!(
            download.get_download_file_read_writer("blob").unwrap_err(),
            StoreError::FileState { .. }
        ));
        Ok(())
    }

    #[test]
    fn cache_ref_counts_round_trip() -> anyhow::Result<()> {
        let (_root, cas) = cas();
        let cache = cas.cache();
        cache.create_cache_file("counted", 1)?;
        assert_eq!(cache.increment_cache_file_ref_count("counted")?, 1);
        assert_eq!(cache.increment_cache_file_ref_count("counted")?, 2);
        assert_eq!(cache.decrement_cache_file_ref_count("counted")?, 1);
        Ok(())
    }

    #[test]
    fn cache_persist_blocks_delete_until_cleared() -> anyhow::Result<()> {
        let (_root, cas) = cas();
        let cache = cas.cache();
        cache.create_cache_file("x", 1)?;
        cache.set_cache_file_metadata("x", &Metadata::Persist(true))?;
        assert!(matches!(
            cache.delete_cache_file("x").unwrap_err(),
            StoreError::FilePersisted { .. }
        ));
        cache.set_cache_file_metadata("x", &Metadata::Persist(false))?;
        cache.delete_cache_file("x")?;
        assert!(cache.get_cache_file_stat("x").unwrap_err().is_not_found());
        Ok(())
    }
}
