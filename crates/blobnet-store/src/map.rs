//! Thread-safe name-to-entry index with per-entry reader/writer locks.
//!
//! Two variants share one contract: a LAT map that only tracks
//! last-access times, and an LRU map that additionally evicts the
//! least-recently touched entry once a capacity is exceeded. Lookup
//! closures always run with the map mutex released; the map mutex is a
//! leaf lock that is never held while waiting on an entry lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::entry::FileEntry;
use crate::error::{StoreError, StoreResult};
use crate::metadata::Metadata;

/// Default last-access-time write throttle.
pub const DEFAULT_LAT_RESOLUTION: Duration = Duration::from_secs(300);

/// Outcome of [`FileMap::try_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryStore {
    /// The entry was inserted and initialized.
    Stored,
    /// The init closure returned `false`; the entry was removed again.
    Discarded,
    /// The name was already mapped; the caller's entry was dropped.
    Existed,
}

struct MapEntry {
    lock: RwLock<FileEntry>,
    /// Unix seconds of the last persisted access-time sidecar write.
    lat_stamp: AtomicU64,
    /// Current key in the eviction order; zero when not ordered.
    touch: AtomicU64,
}

impl MapEntry {
    fn new(entry: FileEntry) -> Self {
        Self {
            lock: RwLock::new(entry),
            lat_stamp: AtomicU64::new(0),
            touch: AtomicU64::new(0),
        }
    }
}

struct Inner {
    entries: HashMap<String, Arc<MapEntry>>,
    /// Touch-counter key to name, oldest first.
    order: BTreeMap<u64, String>,
    next_touch: u64,
}

/// Name-to-entry index; see the module docs for the variant semantics.
pub struct FileMap {
    inner: Mutex<Inner>,
    resolution: Duration,
    capacity: Option<usize>,
}

impl FileMap {
    /// A map that tracks last-access times without a capacity cap.
    #[must_use]
    pub fn new_lat(resolution: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_touch: 1,
            }),
            resolution,
            capacity: None,
        }
    }

    /// A map that evicts the least-recently touched entry beyond
    /// `capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] when `capacity` is zero.
    pub fn new_lru(capacity: usize, resolution: Duration) -> StoreResult<Self> {
        if capacity == 0 {
            return Err(StoreError::Config {
                field: "capacity",
                reason: "must be positive",
            });
        }
        let mut map = Self::new_lat(resolution);
        map.capacity = Some(capacity);
        Ok(map)
    }

    /// Number of mapped entries, persisted ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// True when no entries are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `name` is mapped.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock_inner().entries.contains_key(name)
    }

    /// Run `f` under the entry's read lock without touching access time
    /// or eviction order.
    pub fn peek<R>(&self, name: &str, f: impl FnOnce(&FileEntry) -> R) -> Option<R> {
        let arc = self.get(name)?;
        let guard = read_entry(&arc);
        Some(f(&guard))
    }

    /// Run `f` under the entry's read lock; refreshes access time and
    /// eviction order.
    pub fn read_for_read<R>(&self, name: &str, f: impl FnOnce(&FileEntry) -> R) -> Option<R> {
        let arc = self.get_and_touch(name)?;
        let guard = read_entry(&arc);
        self.maybe_persist_lat(&arc, &guard);
        Some(f(&guard))
    }

    /// Run `f` under the entry's write lock; refreshes access time and
    /// eviction order.
    pub fn read_for_write<R>(&self, name: &str, f: impl FnOnce(&FileEntry) -> R) -> Option<R> {
        let arc = self.get_and_touch(name)?;
        let guard = write_entry(&arc);
        self.maybe_persist_lat(&arc, &guard);
        Some(f(&guard))
    }

    /// Insert `entry` under `name` unless the name is already mapped.
    ///
    /// On insertion, `init` runs under the new entry's pre-acquired
    /// write lock; returning `false` or an error removes the entry
    /// again. When the name is mapped, the caller's entry is dropped and
    /// the existing mapping's access time is refreshed.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `init`.
    pub fn try_store(
        &self,
        name: &str,
        entry: FileEntry,
        init: impl FnOnce(&FileEntry) -> StoreResult<bool>,
    ) -> StoreResult<TryStore> {
        let arc = Arc::new(MapEntry::new(entry));
        // Acquire the write lock before publishing the entry so no other
        // thread can observe it mid-initialization.
        let guard = write_entry(&arc);

        {
            let mut inner = self.lock_inner();
            if let Some(existing) = inner.entries.get(name) {
                let existing = Arc::clone(existing);
                Self::touch_locked(&mut inner, name, &existing);
                drop(inner);
                let existing_guard = read_entry(&existing);
                self.maybe_persist_lat(&existing, &existing_guard);
                return Ok(TryStore::Existed);
            }
            inner.entries.insert(name.to_string(), Arc::clone(&arc));
            Self::touch_locked(&mut inner, name, &arc);
        }

        match init(&guard) {
            Ok(true) => {}
            Ok(false) => {
                self.remove_if_same(name, &arc);
                return Ok(TryStore::Discarded);
            }
            Err(err) => {
                self.remove_if_same(name, &arc);
                return Err(err);
            }
        }
        self.maybe_persist_lat(&arc, &guard);
        drop(guard);

        self.maybe_evict();
        Ok(TryStore::Stored)
    }

    /// Run `f` under the entry's write lock and remove the mapping when
    /// `f` returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FileNotFound`] when the name is unmapped;
    /// propagates errors from `f` (the entry then stays mapped).
    pub fn delete(
        &self,
        name: &str,
        f: impl FnOnce(&FileEntry) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        let arc = self
            .get(name)
            .ok_or_else(|| StoreError::file_not_found(name))?;
        let guard = write_entry(&arc);
        if !self.is_current(name, &arc) {
            // Deleted and possibly reinserted while we waited for the lock.
            return Err(StoreError::file_not_found(name));
        }
        if f(&guard)? {
            self.remove_if_same(name, &arc);
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Option<Arc<MapEntry>> {
        self.lock_inner().entries.get(name).cloned()
    }

    fn get_and_touch(&self, name: &str) -> Option<Arc<MapEntry>> {
        let mut inner = self.lock_inner();
        let arc = inner.entries.get(name).cloned()?;
        Self::touch_locked(&mut inner, name, &arc);
        Some(arc)
    }

    fn touch_locked(inner: &mut Inner, name: &str, arc: &Arc<MapEntry>) {
        let key = inner.next_touch;
        inner.next_touch += 1;
        let old = arc.touch.swap(key, Ordering::AcqRel);
        if old != 0 {
            inner.order.remove(&old);
        }
        inner.order.insert(key, name.to_string());
    }

    fn is_current(&self, name: &str, arc: &Arc<MapEntry>) -> bool {
        matches!(
            self.lock_inner().entries.get(name),
            Some(current) if Arc::ptr_eq(current, arc)
        )
    }

    fn remove_if_same(&self, name: &str, arc: &Arc<MapEntry>) {
        let mut inner = self.lock_inner();
        if let Some(current) = inner.entries.get(name) {
            if Arc::ptr_eq(current, arc) {
                inner.entries.remove(name);
                let key = arc.touch.swap(0, Ordering::AcqRel);
                if key != 0 {
                    inner.order.remove(&key);
                }
            }
        }
    }

    /// Persist the last-access-time sidecar at most once per
    /// `resolution`; the compare-exchange on the in-memory stamp elects
    /// a single writer per window.
    fn maybe_persist_lat(&self, arc: &Arc<MapEntry>, entry: &FileEntry) {
        let now = unix_now();
        let stamp = arc.lat_stamp.load(Ordering::Acquire);
        if stamp != 0 && now.saturating_sub(stamp) < self.resolution.as_secs() {
            return;
        }
        if arc
            .lat_stamp
            .compare_exchange(stamp, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(err) = entry.set_metadata(&Metadata::LastAccessTime(now)) {
            warn!(
                name = %entry.name(),
                error = %err,
                "failed to persist last access time"
            );
        }
    }

    fn maybe_evict(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        loop {
            let victim = {
                let mut inner = self.lock_inner();
                if inner.entries.len() <= capacity {
                    return;
                }
                let Some((&key, _)) = inner.order.iter().next() else {
                    // Only skip-evicted entries remain over capacity.
                    return;
                };
                let name = inner.order.remove(&key).unwrap_or_default();
                inner.entries.get(&name).cloned().map(|arc| (name, arc))
            };
            let Some((name, arc)) = victim else {
                continue;
            };

            let guard = write_entry(&arc);
            if !self.is_current(&name, &arc) {
                continue;
            }
            match guard.delete() {
                Ok(()) => {
                    drop(guard);
                    self.remove_if_same(&name, &arc);
                    debug!(name = %name, "evicted least-recently used file");
                }
                Err(StoreError::FilePersisted { .. }) => {
                    // Skip-evict: out of the order, still mapped and on disk.
                    arc.touch.store(0, Ordering::Release);
                    debug!(name = %name, "skipping eviction of persisted file");
                }
                Err(err) => {
                    arc.touch.store(0, Ordering::Release);
                    warn!(name = %name, error = %err, "eviction delete failed");
                }
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_entry(arc: &Arc<MapEntry>) -> RwLockReadGuard<'_, FileEntry> {
    arc.lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_entry(arc: &Arc<MapEntry>) -> RwLockWriteGuard<'_, FileEntry> {
    arc.lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
