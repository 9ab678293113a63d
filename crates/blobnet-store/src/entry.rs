//! One file on disk plus its metadata sidecars.
//!
//! A [`FileEntry`] owns the directory holding a `data` file and the
//! sidecars next to it. Entry methods take `&self`: operation-level
//! mutual exclusion is provided by the per-entry reader/writer lock in
//! the file map, and interior mutexes guard the state field and suffix
//! set. Mutating operations must be called under the entry's write lock,
//! read-only operations under the read lock.

use std::collections::BTreeSet;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::metadata::{self, Metadata};
use crate::path::{FileState, PathPolicy};

/// Size information for a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Data file length in bytes.
    pub size: u64,
}

/// One managed file: data file, state, and metadata suffix set.
#[derive(Debug)]
pub struct FileEntry {
    name: String,
    relative_path: PathBuf,
    state: Mutex<FileState>,
    suffixes: Mutex<BTreeSet<String>>,
}

impl FileEntry {
    /// Build an entry for `name` in `state` under `policy`.
    ///
    /// The entry is purely in-memory until [`FileEntry::create`] or
    /// [`FileEntry::move_from`] materializes the data file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidName`] when the policy rejects the
    /// name.
    pub fn new(state: FileState, name: &str, policy: &PathPolicy) -> StoreResult<Self> {
        let relative_path = policy.relative_path(name)?;
        Ok(Self {
            name: name.to_string(),
            relative_path,
            state: Mutex::new(state),
            suffixes: Mutex::new(BTreeSet::new()),
        })
    }

    /// The entry's logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry's current state.
    #[must_use]
    pub fn state(&self) -> FileState {
        self.lock_state().clone()
    }

    /// Absolute path of the data file.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.lock_state().dir().join(&self.relative_path)
    }

    /// Absolute path of the directory holding data file and sidecars.
    #[must_use]
    pub fn entry_dir(&self) -> PathBuf {
        let data = self.data_path();
        data.parent().map_or(data.clone(), Path::to_path_buf)
    }

    /// Create the data file in `target`, truncated to `len` bytes.
    ///
    /// # Errors
    ///
    /// - [`StoreError::FileState`] when the entry is not in `target`.
    /// - [`StoreError::FileExists`] when the data file is already present.
    /// - [`StoreError::Io`] on filesystem failure.
    pub fn create(&self, target: &FileState, len: u64) -> StoreResult<()> {
        self.check_state(target)?;
        let data = self.data_path();
        let dir = self.entry_dir();
        make_entry_dir(&dir)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&data)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    StoreError::exists(&self.name)
                } else {
                    StoreError::io("create.open", &data, e)
                }
            })?;
        file.set_len(len)
            .map_err(|e| StoreError::io("create.truncate", &data, e))
    }

    /// Atomically move an unmanaged file at `source` into `target`.
    ///
    /// The source must be on the same filesystem; a cross-device rename
    /// error is surfaced as-is in the IO source.
    ///
    /// # Errors
    ///
    /// Same contract as [`FileEntry::create`], plus rename failures.
    pub fn move_from(&self, target: &FileState, source: &Path) -> StoreResult<()> {
        self.check_state(target)?;
        let data = self.data_path();
        if data.exists() {
            return Err(StoreError::exists(&self.name));
        }
        make_entry_dir(&self.entry_dir())?;
        fs::rename(source, &data).map_err(|e| StoreError::io("move_from.rename", source, e))
    }

    /// Move the entry to `goal`: movable sidecars are copied first, then
    /// the data file is renamed, then the old directory is removed.
    ///
    /// Non-movable sidecars are lost by design. The state field is
    /// updated only after the rename succeeds.
    ///
    /// # Errors
    ///
    /// - [`StoreError::FileExists`] when the entry is already in `goal`
    ///   or the goal data file exists.
    /// - [`StoreError::Io`] on filesystem failure.
    pub fn move_to(&self, goal: &FileState) -> StoreResult<()> {
        let mut state = self.lock_state();
        if *state == *goal {
            return Err(StoreError::exists(&self.name));
        }
        let source_data = state.dir().join(&self.relative_path);
        let target_data = goal.dir().join(&self.relative_path);
        if target_data.exists() {
            return Err(StoreError::exists(&self.name));
        }
        let source_dir = source_data
            .parent()
            .map_or_else(|| source_data.clone(), Path::to_path_buf);
        let target_dir = target_data
            .parent()
            .map_or_else(|| target_data.clone(), Path::to_path_buf);
        make_entry_dir(&target_dir)?;

        let suffixes = self.lock_suffixes().clone();
        for suffix in &suffixes {
            let Some(kind) = metadata::from_suffix(suffix) else {
                continue;
            };
            if !kind.movable() {
                continue;
            }
            let from = source_dir.join(suffix);
            let to = target_dir.join(suffix);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io("move.copy_metadata", parent, e))?;
            }
            fs::copy(&from, &to).map_err(|e| StoreError::io("move.copy_metadata", &from, e))?;
        }

        fs::rename(&source_data, &target_data)
            .map_err(|e| StoreError::io("move.rename", &source_data, e))?;
        *state = goal.clone();
        drop(state);

        self.lock_suffixes().retain(|suffix| {
            metadata::from_suffix(suffix).is_some_and(|kind| kind.movable())
        });

        if let Err(err) = fs::remove_dir_all(&source_dir) {
            warn!(
                name = %self.name,
                path = %source_dir.display(),
                error = %err,
                "failed to remove stale entry directory after move"
            );
        }
        Ok(())
    }

    /// Hard-link the data file to an external path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileExists`] when `target` already exists.
    pub fn link_to(&self, target: &Path) -> StoreResult<()> {
        if target.exists() {
            return Err(StoreError::exists(&self.name));
        }
        let data = self.data_path();
        fs::hard_link(&data, target).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StoreError::exists(&self.name)
            } else {
                StoreError::io("link.hard_link", &data, e)
            }
        })
    }

    /// Remove the entry's entire directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FilePersisted`] when a `persist=true`
    /// sidecar is present.
    pub fn delete(&self) -> StoreResult<()> {
        let mut persist = Metadata::Persist(false);
        match self.get_metadata(&mut persist) {
            Ok(()) => {
                if persist == Metadata::Persist(true) {
                    return Err(StoreError::persisted(&self.name));
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let dir = self.entry_dir();
        fs::remove_dir_all(&dir).map_err(|e| StoreError::io("delete.remove_dir", &dir, e))
    }

    /// Size of the data file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] when the data file is absent.
    pub fn stat(&self) -> StoreResult<FileStat> {
        let data = self.data_path();
        let meta = fs::metadata(&data).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::file_not_found(&self.name)
            } else {
                StoreError::io("stat.metadata", &data, e)
            }
        })?;
        Ok(FileStat { size: meta.len() })
    }

    /// Open a read-only descriptor on the data file.
    ///
    /// The returned handle is owned by the caller and stays readable
    /// even if the entry is later moved, evicted, or deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] when the data file is absent.
    pub fn get_reader(&self) -> StoreResult<FileReader> {
        Ok(FileReader {
            inner: Handle::open(&self.name, &self.data_path(), false)?,
        })
    }

    /// Open a read-write descriptor on the data file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] when the data file is absent.
    pub fn get_read_writer(&self) -> StoreResult<FileReadWriter> {
        Ok(FileReadWriter {
            inner: Handle::open(&self.name, &self.data_path(), true)?,
        })
    }

    /// Fill `md` from its sidecar file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MetadataNotFound`] when the sidecar is
    /// absent.
    pub fn get_metadata(&self, md: &mut Metadata) -> StoreResult<()> {
        let suffix = md.suffix();
        let path = self.metadata_path(&suffix);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::metadata_not_found(&self.name, suffix));
            }
            Err(e) => return Err(StoreError::io("metadata.read", &path, e)),
        };
        md.deserialize_into(&bytes)?;
        self.lock_suffixes().insert(suffix);
        Ok(())
    }

    /// Write `md`'s sidecar, but only when the serialized bytes differ
    /// from the current file. Returns whether the file was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn set_metadata(&self, md: &Metadata) -> StoreResult<bool> {
        let suffix = md.suffix();
        let path = self.metadata_path(&suffix);
        let bytes = md.serialize()?;
        match fs::read(&path) {
            Ok(current) if current == bytes => {
                self.lock_suffixes().insert(suffix);
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("metadata.read", &path, e)),
        }
        self.write_metadata_file(&path, &bytes)?;
        self.lock_suffixes().insert(suffix);
        Ok(true)
    }

    /// Compare-and-write `bytes` into the sidecar at `offset`. Returns
    /// `false` when the region already equals `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MetadataNotFound`] when the sidecar is
    /// absent, [`StoreError::Io`] when the region is out of bounds or
    /// the write fails.
    pub fn set_metadata_at(&self, md: &Metadata, bytes: &[u8], offset: u64) -> StoreResult<bool> {
        let suffix = md.suffix();
        let path = self.metadata_path(&suffix);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::metadata_not_found(&self.name, suffix));
            }
            Err(e) => return Err(StoreError::io("metadata.open", &path, e)),
        };
        let mut current = vec![0_u8; bytes.len()];
        file.read_exact_at(&mut current, offset)
            .map_err(|e| StoreError::io("metadata.read_at", &path, e))?;
        if current == bytes {
            return Ok(false);
        }
        file.write_all_at(bytes, offset)
            .map_err(|e| StoreError::io("metadata.write_at", &path, e))?;
        Ok(true)
    }

    /// Initialize the sidecar from `md` if absent, otherwise fill `md`
    /// from disk. Returns whether the sidecar was created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn get_or_set_metadata(&self, md: &mut Metadata) -> StoreResult<bool> {
        let suffix = md.suffix();
        let path = self.metadata_path(&suffix);
        if path.exists() {
            self.get_metadata(md)?;
            return Ok(false);
        }
        let bytes = md.serialize()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("metadata.mkdir", parent, e))?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&bytes)
                    .map_err(|e| StoreError::io("metadata.write", &path, e))?;
                self.lock_suffixes().insert(suffix);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost an init race; the winner's value stands.
                self.get_metadata(md)?;
                Ok(false)
            }
            Err(e) => Err(StoreError::io("metadata.create", &path, e)),
        }
    }

    /// Increment the reference-count sidecar, initializing it at zero;
    /// returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn increment_ref_count(&self) -> StoreResult<u64> {
        self.adjust_ref_count(1)
    }

    /// Decrement the reference-count sidecar, saturating at zero;
    /// returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn decrement_ref_count(&self) -> StoreResult<u64> {
        self.adjust_ref_count(-1)
    }

    fn adjust_ref_count(&self, delta: i64) -> StoreResult<u64> {
        let mut md = Metadata::RefCount(0);
        self.get_or_set_metadata(&mut md)?;
        let Metadata::RefCount(current) = md else {
            unreachable!("get_or_set preserves the metadata kind");
        };
        let next = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        self.set_metadata(&Metadata::RefCount(next))?;
        Ok(next)
    }

    /// Remove the sidecar for `md`'s kind. Absent sidecars are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure.
    pub fn delete_metadata(&self, md: &Metadata) -> StoreResult<()> {
        let suffix = md.suffix();
        let path = self.metadata_path(&suffix);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(StoreError::io("metadata.remove", &path, e));
            }
        }
        self.lock_suffixes().remove(&suffix);
        Ok(())
    }

    /// Visit every present sidecar in suffix order; `visit` returns
    /// `false` to stop early.
    ///
    /// # Errors
    ///
    /// Propagates the first error from reading a sidecar or from `visit`.
    pub fn range_metadata(
        &self,
        mut visit: impl FnMut(&Metadata) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        let suffixes = self.lock_suffixes().clone();
        for suffix in suffixes {
            let Some(mut kind) = metadata::from_suffix(&suffix) else {
                continue;
            };
            match self.get_metadata(&mut kind) {
                Ok(()) => {}
                // Deleted under us between the snapshot and the read.
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
            if !visit(&kind)? {
                break;
            }
        }
        Ok(())
    }

    /// Rebuild the in-memory suffix set from the sidecar files on disk.
    ///
    /// Idempotent: running it twice yields the same set. Unknown files
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] when the data file is absent.
    pub fn reload(&self) -> StoreResult<()> {
        let data = self.data_path();
        if !data.exists() {
            return Err(StoreError::file_not_found(&self.name));
        }
        let dir = self.entry_dir();
        let mut reloaded = BTreeSet::new();
        for item in WalkDir::new(&dir) {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    warn!(
                        name = %self.name,
                        path = %dir.display(),
                        error = %err,
                        "failed to traverse entry directory during reload"
                    );
                    continue;
                }
            };
            if !item.file_type().is_file() || item.path() == data.as_path() {
                continue;
            }
            let Ok(relative) = item.path().strip_prefix(&dir) else {
                continue;
            };
            let Some(suffix) = relative.to_str() else {
                continue;
            };
            if metadata::from_suffix(suffix).is_some() {
                reloaded.insert(suffix.to_string());
            }
        }
        *self.lock_suffixes() = reloaded;
        Ok(())
    }

    fn metadata_path(&self, suffix: &str) -> PathBuf {
        self.entry_dir().join(suffix)
    }

    fn write_metadata_file(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("metadata.mkdir", parent, e))?;
        }
        // Write-then-rename so readers racing a throttled access-time
        // update never observe a torn sidecar.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| StoreError::io("metadata.write", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| StoreError::io("metadata.rename", &tmp, e))
    }

    fn check_state(&self, target: &FileState) -> StoreResult<()> {
        let state = self.lock_state();
        if *state != *target {
            return Err(StoreError::FileState {
                name: self.name.clone(),
                actual: state.dir().to_path_buf(),
                expected: vec![target.dir().to_path_buf()],
            });
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_suffixes(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.suffixes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn make_entry_dir(dir: &Path) -> StoreResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(dir)
        .map_err(|e| StoreError::io("mkdir", dir, e))
}

/// Shared descriptor plumbing behind the reader/read-writer handles.
#[derive(Debug)]
struct Handle {
    file: Option<File>,
    path: PathBuf,
}

impl Handle {
    fn open(name: &str, path: &Path, writable: bool) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    StoreError::file_not_found(name)
                } else {
                    StoreError::io("handle.open", path, e)
                }
            })?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(|| io::Error::other("handle closed"))
    }

    fn file_ref(&self) -> io::Result<&File> {
        self.file.as_ref().ok_or_else(|| io::Error::other("handle closed"))
    }

    fn size(&self) -> io::Result<u64> {
        // An open descriptor answers even after the path is unlinked;
        // a closed handle falls back to the entry's data path.
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(fs::metadata(&self.path)?.len()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.take();
        Ok(())
    }
}

/// Read-only descriptor on a stored file.
#[derive(Debug)]
pub struct FileReader {
    inner: Handle,
}

impl FileReader {
    /// Positional read at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the handle is closed or the read fails.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.inner.file_ref()?.read_at(buf, offset)
    }

    /// Data file size; works after `close` by consulting the entry path.
    ///
    /// # Errors
    ///
    /// Returns an IO error when neither descriptor nor path answers.
    pub fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    /// Release the descriptor. Double close is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.file()?.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.file()?.seek(pos)
    }
}

/// Read-write descriptor on a stored file, carrying the registry upload
/// protocol's `commit`/`cancel` pair.
#[derive(Debug)]
pub struct FileReadWriter {
    inner: Handle,
}

impl FileReadWriter {
    /// Positional read at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the handle is closed or the read fails.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.inner.file_ref()?.read_at(buf, offset)
    }

    /// Positional write of the whole buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the handle is closed or the write fails.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.inner.file_ref()?.write_all_at(buf, offset)
    }

    /// Data file size; works after `close` by consulting the entry path.
    ///
    /// # Errors
    ///
    /// Returns an IO error when neither descriptor nor path answers.
    pub fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    /// Flush written bytes to stable storage and close the descriptor.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the sync fails.
    pub fn commit(&mut self) -> io::Result<()> {
        if let Some(file) = &self.inner.file {
            file.sync_all()?;
        }
        self.inner.close()
    }

    /// Abandon the handle and close the descriptor; written bytes are
    /// left as-is for the caller to clean up.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn cancel(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    /// Release the descriptor. Double close is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

impl Read for FileReadWriter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.file()?.read(buf)
    }
}

impl Write for FileReadWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.file()?.flush()
    }
}

impl Seek for FileReadWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.file()?.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, FileState, FileState) {
        let root = TempDir::new().expect("temp root");
        let download = FileState::new(root.path().join("download"));
        let cache = FileState::new(root.path().join("cache"));
        (root, download, cache)
    }

    fn new_entry(state: &FileState, name: &str) -> FileEntry {
        FileEntry::new(state.clone(), name, &PathPolicy::Flat).expect("entry")
    }

    #[test]
    fn create_rejects_double_create() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-a");
        entry.create(&download, 10)?;
        assert_eq!(entry.stat()?.size, 10);
        assert!(entry.create(&download, 10).unwrap_err().is_exists());
        Ok(())
    }

    #[test]
    fn create_rejects_wrong_state() {
        let (_root, download, cache) = fixture();
        let entry = new_entry(&download, "blob-a");
        let err = entry.create(&cache, 10).unwrap_err();
        assert!(matches!(err, StoreError::FileState { .. }));
    }

    #[test]
    fn move_from_ingests_unmanaged_file() -> anyhow::Result<()> {
        let (root, download, _cache) = fixture();
        let source = root.path().join("incoming");
        fs::write(&source, b"payload")?;
        let entry = new_entry(&download, "blob-b");
        entry.move_from(&download, &source)?;
        assert!(!source.exists());
        assert_eq!(entry.stat()?.size, 7);
        Ok(())
    }

    #[test]
    fn move_carries_movable_sidecars_only() -> anyhow::Result<()> {
        let (_root, download, cache) = fixture();
        let entry = new_entry(&download, "blob-c");
        entry.create(&download, 4)?;
        entry.set_metadata(&Metadata::MockOne(b"keep".to_vec()))?;
        entry.set_metadata(&Metadata::MockTwo(b"drop".to_vec()))?;

        entry.move_to(&cache)?;
        assert_eq!(entry.state(), cache);
        assert!(entry.data_path().starts_with(cache.dir()));

        let mut kept = Metadata::MockOne(Vec::new());
        entry.get_metadata(&mut kept)?;
        assert_eq!(kept, Metadata::MockOne(b"keep".to_vec()));

        let mut dropped = Metadata::MockTwo(Vec::new());
        assert!(entry.get_metadata(&mut dropped).unwrap_err().is_not_found());

        // The old state directory is gone.
        assert!(!download.dir().join("blob-c").exists());
        // Moving into the state the entry is already in reports exists.
        assert!(entry.move_to(&cache).unwrap_err().is_exists());
        Ok(())
    }

    #[test]
    fn delete_honors_persist() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-d");
        entry.create(&download, 1)?;
        entry.set_metadata(&Metadata::Persist(true))?;
        assert!(matches!(
            entry.delete().unwrap_err(),
            StoreError::FilePersisted { .. }
        ));
        entry.set_metadata(&Metadata::Persist(false))?;
        entry.delete()?;
        assert!(!entry.entry_dir().exists());
        Ok(())
    }

    #[test]
    fn link_to_rejects_existing_target() -> anyhow::Result<()> {
        let (root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-e");
        entry.create(&download, 3)?;
        let target = root.path().join("exported");
        entry.link_to(&target)?;
        assert_eq!(fs::metadata(&target)?.len(), 3);
        assert!(entry.link_to(&target).unwrap_err().is_exists());
        Ok(())
    }

    #[test]
    fn set_metadata_is_compare_and_write() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-f");
        entry.create(&download, 1)?;
        assert!(entry.set_metadata(&Metadata::MockOne(b"v1".to_vec()))?);
        assert!(!entry.set_metadata(&Metadata::MockOne(b"v1".to_vec()))?);
        assert!(entry.set_metadata(&Metadata::MockOne(b"v2".to_vec()))?);
        Ok(())
    }

    #[test]
    fn set_metadata_at_updates_single_region() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-g");
        entry.create(&download, 1)?;
        let status = Metadata::PieceStatus(vec![0, 0, 0]);
        entry.set_metadata(&status)?;

        assert!(entry.set_metadata_at(&status, &[1], 1)?);
        // Same bytes at the same region: a no-op.
        assert!(!entry.set_metadata_at(&status, &[1], 1)?);

        let mut readback = Metadata::PieceStatus(Vec::new());
        entry.get_metadata(&mut readback)?;
        assert_eq!(readback, Metadata::PieceStatus(vec![0, 1, 0]));

        // Out-of-bounds regions error rather than extending the file.
        assert!(entry.set_metadata_at(&status, &[1], 9).is_err());
        Ok(())
    }

    #[test]
    fn get_or_set_initializes_once() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-h");
        entry.create(&download, 1)?;

        let mut first = Metadata::RefCount(7);
        assert!(entry.get_or_set_metadata(&mut first)?);

        let mut second = Metadata::RefCount(99);
        assert!(!entry.get_or_set_metadata(&mut second)?);
        assert_eq!(second, Metadata::RefCount(7));
        Ok(())
    }

    #[test]
    fn ref_counts_saturate_at_zero() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-rc");
        entry.create(&download, 1)?;

        assert_eq!(entry.increment_ref_count()?, 1);
        assert_eq!(entry.increment_ref_count()?, 2);
        assert_eq!(entry.decrement_ref_count()?, 1);
        assert_eq!(entry.decrement_ref_count()?, 0);
        assert_eq!(entry.decrement_ref_count()?, 0);

        let mut count = Metadata::RefCount(99);
        entry.get_metadata(&mut count)?;
        assert_eq!(count, Metadata::RefCount(0));
        Ok(())
    }

    #[test]
    fn range_visits_sidecars_in_suffix_order() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-i");
        entry.create(&download, 1)?;
        entry.set_metadata(&Metadata::Persist(true))?;
        entry.set_metadata(&Metadata::RefCount(2))?;

        let mut seen = Vec::new();
        entry.range_metadata(|md| {
            seen.push(md.suffix());
            Ok(true)
        })?;
        assert_eq!(seen, vec!["_persist".to_string(), "_refcount".to_string()]);

        let mut stopped = Vec::new();
        entry.range_metadata(|md| {
            stopped.push(md.suffix());
            Ok(false)
        })?;
        assert_eq!(stopped.len(), 1);
        Ok(())
    }

    #[test]
    fn reload_rebuilds_suffix_set_idempotently() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-j");
        entry.create(&download, 1)?;
        entry.set_metadata(&Metadata::MockOne(b"foo".to_vec()))?;
        entry.set_metadata(&Metadata::HashState {
            algo: "sha256".to_string(),
            offset: "0".to_string(),
            bytes: b"hs".to_vec(),
        })?;
        // Unknown files in the entry dir are ignored.
        fs::write(entry.entry_dir().join("_unregistered"), b"junk")?;

        let fresh = new_entry(&download, "blob-j");
        fresh.reload()?;
        let mut seen = Vec::new();
        fresh.range_metadata(|md| {
            seen.push(md.suffix());
            Ok(true)
        })?;
        assert_eq!(
            seen,
            vec!["_hashstates/sha256/0".to_string(), "_mock_one".to_string()]
        );

        fresh.reload()?;
        let mut again = Vec::new();
        fresh.range_metadata(|md| {
            again.push(md.suffix());
            Ok(true)
        })?;
        assert_eq!(again, seen);
        Ok(())
    }

    #[test]
    fn reader_survives_delete() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-k");
        entry.create(&download, 0)?;
        let mut writer = entry.get_read_writer()?;
        writer.write_at(b"0123456789", 0)?;
        writer.commit()?;

        let mut reader = entry.get_reader()?;
        entry.delete()?;

        let mut buf = vec![0_u8; 10];
        let read = reader.read_at(&mut buf, 0)?;
        assert_eq!(&buf[..read], b"0123456789");
        Ok(())
    }

    #[test]
    fn read_writer_size_outlives_close() -> anyhow::Result<()> {
        let (_root, download, _cache) = fixture();
        let entry = new_entry(&download, "blob-l");
        entry.create(&download, 16)?;
        let mut writer = entry.get_read_writer()?;
        writer.commit()?;
        assert_eq!(writer.size()?, 16);
        // Reads through a committed handle fail, size still answers.
        assert!(writer.read_at(&mut [0_u8; 1], 0).is_err());
        writer.close()?;
        Ok(())
    }
}
