//! File store orchestration: accept-state contracts over the file map.
//!
//! A [`FileStore`] couples one path policy with one file map. Every
//! operation goes through a short-lived [`FileOp`] naming the set of
//! acceptable states; files found in any other state are rejected with
//! a state error. A `FileOp` also transparently reloads entries that a
//! previous process persisted to disk.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::entry::{FileEntry, FileReadWriter, FileReader, FileStat};
use crate::error::{StoreError, StoreResult};
use crate::map::{FileMap, TryStore};
use crate::metadata::Metadata;
use crate::path::{FileState, PathPolicy};

/// Thin holder of an entry factory (the path policy) and a file map.
pub struct FileStore {
    policy: PathPolicy,
    map: Arc<FileMap>,
}

impl FileStore {
    /// Couple `policy` with `map`.
    #[must_use]
    pub fn new(policy: PathPolicy, map: FileMap) -> Self {
        Self {
            policy,
            map: Arc::new(map),
        }
    }

    /// Start an operation with an empty acceptable-state set.
    #[must_use]
    pub fn op(&self) -> FileOp<'_> {
        FileOp {
            store: self,
            states: Vec::new(),
        }
    }

    /// The store's path policy.
    #[must_use]
    pub const fn policy(&self) -> &PathPolicy {
        &self.policy
    }
}

/// A short-lived operation bound to a set of acceptable file states.
pub struct FileOp<'a> {
    store: &'a FileStore,
    states: Vec<FileState>,
}

impl FileOp<'_> {
    /// Add `state` to the acceptable set; ordering matters for reload.
    #[must_use]
    pub fn accept_state(mut self, state: &FileState) -> Self {
        self.states.push(state.clone());
        self
    }

    /// Create the data file for `name` in `target`, truncated to `len`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::FileState`] when `target` is not acceptable or the
    ///   file exists in a different state.
    /// - [`StoreError::FileExists`] when the file already exists in
    ///   `target`.
    pub fn create_file(&self, name: &str, target: &FileState, len: u64) -> StoreResult<()> {
        self.check_target(name, target)?;
        self.materialize(name, target, |entry| entry.create(target, len))
    }

    /// Atomically move the unmanaged file at `source` in as `name`.
    ///
    /// # Errors
    ///
    /// Same contract as [`FileOp::create_file`]; a cross-device rename
    /// surfaces the underlying IO error as-is.
    pub fn move_file_from(
        &self,
        name: &str,
        target: &FileState,
        source: &std::path::Path,
    ) -> StoreResult<()> {
        self.check_target(name, target)?;
        self.materialize(name, target, |entry| entry.move_from(target, source))
    }

    /// Move `name` from its current (acceptable) state to `goal`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileExists`] when the file is already in
    /// `goal`.
    pub fn move_file(&self, name: &str, goal: &FileState) -> StoreResult<()> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.move_to(goal)
        })
    }

    /// Hard-link `name`'s data file to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileExists`] when `target` exists.
    pub fn link_file_to(&self, name: &str, target: &std::path::Path) -> StoreResult<()> {
        self.ensure_loaded(name)?;
        self.with_read(name, |entry| {
            self.check_state(entry)?;
            entry.link_to(target)
        })
    }

    /// Delete `name`'s entry and unmap it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FilePersisted`] when a persist sidecar
    /// blocks deletion; the entry then stays mapped.
    pub fn delete_file(&self, name: &str) -> StoreResult<()> {
        self.ensure_loaded(name)?;
        self.store.map.delete(name, |entry| {
            self.check_state(entry)?;
            entry.delete()?;
            Ok(true)
        })
    }

    /// Absolute path of `name`'s data file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn get_file_path(&self, name: &str) -> StoreResult<PathBuf> {
        self.ensure_loaded(name)?;
        self.with_peek(name, |entry| {
            self.check_state(entry)?;
            Ok(entry.data_path())
        })
    }

    /// Size information for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn get_file_stat(&self, name: &str) -> StoreResult<FileStat> {
        self.ensure_loaded(name)?;
        self.with_peek(name, |entry| {
            self.check_state(entry)?;
            entry.stat()
        })
    }

    /// Open a caller-owned read descriptor; refreshes access time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn get_file_reader(&self, name: &str) -> StoreResult<FileReader> {
        self.ensure_loaded(name)?;
        self.with_read(name, |entry| {
            self.check_state(entry)?;
            entry.get_reader()
        })
    }

    /// Open a caller-owned read-write descriptor; refreshes access time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn get_file_read_writer(&self, name: &str) -> StoreResult<FileReadWriter> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.get_read_writer()
        })
    }

    /// Fill `md` from `name`'s sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MetadataNotFound`] when absent.
    pub fn get_file_metadata(&self, name: &str, md: &mut Metadata) -> StoreResult<()> {
        self.ensure_loaded(name)?;
        self.with_peek(name, |entry| {
            self.check_state(entry)?;
            entry.get_metadata(md)
        })
    }

    /// Compare-and-write `md`'s sidecar; returns whether it was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn set_file_metadata(&self, name: &str, md: &Metadata) -> StoreResult<bool> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.set_metadata(md)
        })
    }

    /// Compare-and-write one region of `md`'s sidecar at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MetadataNotFound`] when the sidecar is
    /// absent.
    pub fn set_file_metadata_at(
        &self,
        name: &str,
        md: &Metadata,
        bytes: &[u8],
        offset: u64,
    ) -> StoreResult<bool> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.set_metadata_at(md, bytes, offset)
        })
    }

    /// Initialize `md`'s sidecar if absent, else fill `md` from disk;
    /// returns whether the sidecar was created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn get_or_set_file_metadata(&self, name: &str, md: &mut Metadata) -> StoreResult<bool> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.get_or_set_metadata(md)
        })
    }

    /// Remove `md`'s sidecar; absent sidecars are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn delete_file_metadata(&self, name: &str, md: &Metadata) -> StoreResult<()> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.delete_metadata(md)
        })
    }

    /// Increment `name`'s reference count; returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn increment_file_ref_count(&self, name: &str) -> StoreResult<u64> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.increment_ref_count()
        })
    }

    /// Decrement `name`'s reference count; returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn decrement_file_ref_count(&self, name: &str) -> StoreResult<u64> {
        self.ensure_loaded(name)?;
        self.with_write(name, |entry| {
            self.check_state(entry)?;
            entry.decrement_ref_count()
        })
    }

    /// Visit every sidecar of `name`; `visit` returns `false` to stop.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] on a miss.
    pub fn range_file_metadata(
        &self,
        name: &str,
        visit: impl FnMut(&Metadata) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        self.ensure_loaded(name)?;
        self.with_peek(name, |entry| {
            self.check_state(entry)?;
            entry.range_metadata(visit)
        })
    }

    /// Names present on disk across the acceptable states, sorted and
    /// de-duplicated.
    ///
    /// # Errors
    ///
    /// Currently infallible; traversal failures are skipped.
    pub fn list_names(&self) -> StoreResult<Vec<String>> {
        let mut names = BTreeSet::new();
        for state in &self.states {
            if !state.dir().exists() {
                continue;
            }
            for item in WalkDir::new(state.dir()).into_iter().filter_map(Result::ok) {
                if !item.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = item.path().strip_prefix(state.dir()) else {
                    continue;
                };
                if let Some(name) = self.store.policy.name_from_relative(relative) {
                    names.insert(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Load `name` into the map, reloading a persisted entry from the
    /// first acceptable state whose data file exists.
    fn ensure_loaded(&self, name: &str) -> StoreResult<()> {
        // Validate the name even when the map already knows it.
        let relative = self.store.policy.relative_path(name)?;
        if self.store.map.contains(name) {
            return Ok(());
        }
        for state in &self.states {
            let data = state.dir().join(&relative);
            if !data.exists() {
                continue;
            }
            let entry = FileEntry::new(state.clone(), name, &self.store.policy)?;
            entry.reload()?;
            // A racing loader may have stored first; its entry wins and
            // ours is dropped.
            self.store.map.try_store(name, entry, |_| Ok(true))?;
            return Ok(());
        }
        Err(StoreError::file_not_found(name))
    }

    /// Create-or-mutate plumbing shared by `create_file` and
    /// `move_file_from`.
    fn materialize(
        &self,
        name: &str,
        target: &FileState,
        op: impl Fn(&FileEntry) -> StoreResult<()>,
    ) -> StoreResult<()> {
        match self.ensure_loaded(name) {
            Ok(()) => self.with_write(name, |entry| {
                self.check_state(entry)?;
                op(entry)
            }),
            Err(err) if err.is_not_found() => {
                let entry = FileEntry::new(target.clone(), name, &self.store.policy)?;
                match self
                    .store
                    .map
                    .try_store(name, entry, |entry| op(entry).map(|()| true))?
                {
                    TryStore::Stored | TryStore::Discarded => Ok(()),
                    // Lost an insertion race; retry against the winner.
                    TryStore::Existed => self.with_write(name, |entry| {
                        self.check_state(entry)?;
                        op(entry)
                    }),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn check_target(&self, name: &str, target: &FileState) -> StoreResult<()> {
        if self.states.contains(target) {
            return Ok(());
        }
        Err(StoreError::FileState {
            name: name.to_string(),
            actual: target.dir().to_path_buf(),
            expected: self.expected_dirs(),
        })
    }

    fn check_state(&self, entry: &FileEntry) -> StoreResult<()> {
        let state = entry.state();
        if self.states.contains(&state) {
            return Ok(());
        }
        Err(StoreError::FileState {
            name: entry.name().to_string(),
            actual: state.dir().to_path_buf(),
            expected: self.expected_dirs(),
        })
    }

    fn expected_dirs(&self) -> Vec<PathBuf> {
        self.states
            .iter()
            .map(|state| state.dir().to_path_buf())
            .collect()
    }

    fn with_peek<R>(
        &self,
        name: &str,
        f: impl FnOnce(&FileEntry) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.store
            .map
            .peek(name, f)
            .ok_or_else(|| StoreError::file_not_found(name))?
    }

    fn with_read<R>(
        &self,
        name: &str,
        f: impl FnOnce(&FileEntry) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.store
            .map
            .read_for_read(name, f)
            .ok_or_else(|| StoreError::file_not_found(name))?
    }

    fn with_write<R>(
        &self,
        name: &str,
        f: impl FnOnce(&FileEntry) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.store
            .map
            .read_for_write(name, f)
            .ok_or_else(|| StoreError::file_not_found(name))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::DEFAULT_LAT_RESOLUTION;
    use std::io::Read as _;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        store: FileStore,
        download: FileState,
        cache: FileState,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().expect("temp root");
        let download = FileState::new(root.path().join("download"));
        let cache = FileState::new(root.path().join("cache"));
        let store = FileStore::new(PathPolicy::Flat, FileMap::new_lat(DEFAULT_LAT_RESOLUTION));
        Fixture {
            _root: root,
            store,
            download,
            cache,
        }
    }

    #[test]
    fn create_and_read_through_an_op() -> anyhow::Result<()> {
        let fx = fixture();
        let op = fx.store.op().accept_state(&fx.download);
        op.create_file("a", &fx.download, 4)?;
        assert_eq!(op.get_file_stat("a")?.size, 4);

        let mut writer = op.get_file_read_writer("a")?;
        writer.write_at(b"abcd", 0)?;
        writer.commit()?;

        let mut reader = op.get_file_reader("a")?;
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        assert_eq!(buf, "abcd");
        Ok(())
    }

    #[test]
    fn create_rejects_unaccepted_target() {
        let fx = fixture();
        let op = fx.store.op().accept_state(&fx.download);
        let err = op.create_file("a", &fx.cache, 1).unwrap_err();
        assert!(matches!(err, StoreError::FileState { .. }));
    }

    #[test]
    fn ops_reject_files_outside_their_states() -> anyhow::Result<()> {
        let fx = fixture();
        fx.store
            .op()
            .accept_state(&fx.download)
            .create_file("a", &fx.download, 1)?;

        let cache_only = fx.store.op().accept_state(&fx.cache);
        let err = cache_only.get_file_stat("a").unwrap_err();
        // The entry is mapped in download, which the cache op rejects.
        assert!(matches!(err, StoreError::FileState { .. }));

        // With both states accepted but the entry in download, a
        // cache-targeted create reports the state mismatch.
        let both = fx
            .store
            .op()
            .accept_state(&fx.cache)
            .accept_state(&fx.download);
        let err = both.create_file("a", &fx.cache, 1).unwrap_err();
        assert!(matches!(err, StoreError::FileState { .. }));
        Ok(())
    }

    #[test]
    fn move_file_promotes_between_states() -> anyhow::Result<()> {
        let fx = fixture();
        let op = fx
            .store
            .op()
            .accept_state(&fx.download)
            .accept_state(&fx.cache);
        op.create_file("a", &fx.download, 2)?;
        op.move_file("a", &fx.cache)?;
        assert!(op.get_file_path("a")?.starts_with(fx.cache.dir()));
        // Moving again reports exists.
        assert!(op.move_file("a", &fx.cache).unwrap_err().is_exists());
        Ok(())
    }

    #[test]
    fn move_file_from_ingests_and_rejects_double_ingest() -> anyhow::Result<()> {
        let fx = fixture();
        let source = fx._root.path().join("incoming");
        std::fs::write(&source, b"xyz")?;
        let op = fx.store.op().accept_state(&fx.download);
        op.move_file_from("a", &fx.download, &source)?;
        assert_eq!(op.get_file_stat("a")?.size, 3);

        std::fs::write(fx._root.path().join("again"), b"xyz")?;
        let err = op
            .move_file_from("a", &fx.download, &fx._root.path().join("again"))
            .unwrap_err();
        assert!(err.is_exists());
        Ok(())
    }

    #[test]
    fn reload_on_miss_restores_persisted_entries() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let cache = FileState::new(root.path().join("cache"));
        {
            let store = FileStore::new(PathPolicy::Flat, FileMap::new_lat(DEFAULT_LAT_RESOLUTION));
            let op = store.op().accept_state(&cache);
            op.create_file("b", &cache, 5)?;
            op.set_file_metadata("b", &Metadata::TorrentMeta(b"meta".to_vec()))?;
        }

        // A fresh store (fresh process) reloads the entry from disk.
        let store = FileStore::new(PathPolicy::Flat, FileMap::new_lat(DEFAULT_LAT_RESOLUTION));
        let op = store.op().accept_state(&cache);
        let mut meta = Metadata::TorrentMeta(Vec::new());
        op.get_file_metadata("b", &mut meta)?;
        assert_eq!(meta, Metadata::TorrentMeta(b"meta".to_vec()));
        assert_eq!(op.get_file_stat("b")?.size, 5);
        Ok(())
    }

    #[test]
    fn reload_tries_states_in_order() -> anyhow::Result<()> {
        let fx = fixture();
        fx.store
            .op()
            .accept_state(&fx.cache)
            .create_file("a", &fx.cache, 1)?;

        // A download-first op still finds the cache copy.
        let store = FileStore::new(PathPolicy::Flat, FileMap::new_lat(DEFAULT_LAT_RESOLUTION));
        let op = store
            .op()
            .accept_state(&fx.download)
            .accept_state(&fx.cache);
        assert_eq!(op.get_file_stat("a")?.size, 1);
        Ok(())
    }

    #[test]
    fn delete_file_unmaps_and_removes() -> anyhow::Result<()> {
        let fx = fixture();
        let op = fx.store.op().accept_state(&fx.download);
        op.create_file("a", &fx.download, 1)?;
        op.delete_file("a")?;
        assert!(op.get_file_stat("a").unwrap_err().is_not_found());
        assert!(!fx.download.dir().join("a").exists());
        Ok(())
    }

    #[test]
    fn list_names_reverses_the_policy() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let cache = FileState::new(root.path().join("cache"));
        let store = FileStore::new(
            PathPolicy::default(),
            FileMap::new_lat(DEFAULT_LAT_RESOLUTION),
        );
        let op = store.op().accept_state(&cache);
        op.create_file("0123abcd", &cache, 1)?;
        op.create_file("4567abcd", &cache, 1)?;
        assert_eq!(
            op.list_names()?,
            vec!["0123abcd".to_string(), "4567abcd".to_string()]
        );
        Ok(())
    }

    #[test]
    fn invalid_names_are_rejected_up_front() {
        let fx = fixture();
        let op = fx.store.op().accept_state(&fx.download);
        assert!(matches!(
            op.get_file_stat("../escape").unwrap_err(),
            StoreError::InvalidName { .. }
        ));
    }
}
