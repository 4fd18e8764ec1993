//! Embedded ordered key-value storage with a lock-contention fallback.
//!
//! Only one process may hold a sled store open. When the exclusive open
//! fails because another process owns the lock, this wrapper degrades to a
//! bounded in-memory map, seeded from a best-effort snapshot copy of the
//! on-disk files. Operations keep working; they just stop surviving
//! restarts. Callers surface the degradation through their own stats.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// sled refused an operation.
    #[error("store error: {0}")]
    Sled(#[from] sled::Error),

    /// A persisted record failed to decode.
    #[error("corrupt record under key {key}: {source}")]
    Corrupt {
        /// The key whose value failed to parse.
        key: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem trouble outside sled itself.
    #[error("store io error at {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn corrupt(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Corrupt {
            key: key.into(),
            source,
        }
    }
}

/// Bounded in-memory fallback map. Ordered like sled; FIFO-evicted at the
/// item cap.
#[derive(Debug, Default)]
struct MemoryMap {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    insertion_order: VecDeque<Vec<u8>>,
    cap: usize,
}

impl MemoryMap {
    fn new(cap: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            insertion_order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.insertion_order.push_back(key);
            while self.entries.len() > self.cap {
                if let Some(oldest) = self.insertion_order.pop_front() {
                    self.entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.insertion_order.retain(|k| k != key);
        }
        existed
    }
}

#[derive(Debug)]
enum Inner {
    Sled(sled::Db),
    Memory(Mutex<MemoryMap>),
}

/// Ordered KV store: sled when this process can own the lock, a bounded
/// in-memory map otherwise.
#[derive(Debug)]
pub struct KvStore {
    inner: Inner,
    path: PathBuf,
}

impl KvStore {
    /// Opens the store at `path`, falling back to memory mode on lock
    /// contention. `memory_cap` bounds the fallback map.
    ///
    /// Never fails: the worst outcome is an empty in-memory store.
    #[must_use]
    pub fn open(path: &Path, memory_cap: usize) -> Self {
        if let Err(e) = std::fs::create_dir_all(path) {
            warn!(path = %path.display(), error = %e, "cannot create store directory, using memory mode");
            return Self::memory(path, memory_cap);
        }

        match sled::Config::new().path(path).open() {
            Ok(db) => {
                debug!(path = %path.display(), "opened persistent store");
                Self {
                    inner: Inner::Sled(db),
                    path: path.to_path_buf(),
                }
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "exclusive store open failed, degrading to memory mode"
                );
                let mut store = Self::memory(path, memory_cap);
                store.seed_from_snapshot(path);
                store
            }
        }
    }

    /// Creates a pure in-memory store (used directly by tests and as the
    /// degraded mode).
    #[must_use]
    pub fn memory(path: &Path, memory_cap: usize) -> Self {
        Self {
            inner: Inner::Memory(Mutex::new(MemoryMap::new(memory_cap))),
            path: path.to_path_buf(),
        }
    }

    /// Best-effort read of the locked store's current contents: copy the
    /// sled files aside and open the copy. A torn copy simply fails to
    /// open and the memory map starts empty.
    fn seed_from_snapshot(&mut self, path: &Path) {
        let Ok(snapshot_dir) = tempfile::tempdir() else {
            return;
        };
        if copy_dir(path, snapshot_dir.path()).is_err() {
            return;
        }
        let Ok(db) = sled::Config::new()
            .path(snapshot_dir.path())
            .open()
        else {
            debug!("snapshot copy did not open cleanly, starting empty");
            return;
        };

        let Inner::Memory(map) = &self.inner else {
            return;
        };
        let mut map = map.lock();
        let mut seeded = 0usize;
        for item in db.iter() {
            let Ok((k, v)) = item else { break };
            map.insert(k.to_vec(), v.to_vec());
            seeded += 1;
        }
        info!(seeded, "seeded memory store from locked-store snapshot");
    }

    /// Whether the store is running without persistence.
    #[must_use]
    pub fn memory_mode(&self) -> bool {
        matches!(self.inner, Inner::Memory(_))
    }

    /// Directory this store was opened against.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Propagates sled read failures.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match &self.inner {
            Inner::Sled(db) => Ok(db.get(key)?.map(|v| v.to_vec())),
            Inner::Memory(map) => Ok(map.lock().entries.get(key).cloned()),
        }
    }

    /// Writes a value.
    ///
    /// # Errors
    ///
    /// Propagates sled write failures.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match &self.inner {
            Inner::Sled(db) => {
                db.insert(key, value)?;
                Ok(())
            }
            Inner::Memory(map) => {
                map.lock().insert(key.to_vec(), value.to_vec());
                Ok(())
            }
        }
    }

    /// Removes a key. Returns whether it existed. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates sled write failures.
    pub fn remove(&self, key: &[u8]) -> Result<bool, StoreError> {
        match &self.inner {
            Inner::Sled(db) => Ok(db.remove(key)?.is_some()),
            Inner::Memory(map) => Ok(map.lock().remove(key)),
        }
    }

    /// All entries whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Propagates sled read failures.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        match &self.inner {
            Inner::Sled(db) => {
                let mut out = Vec::new();
                for item in db.scan_prefix(prefix) {
                    let (k, v) = item?;
                    out.push((k.to_vec(), v.to_vec()));
                }
                Ok(out)
            }
            Inner::Memory(map) => {
                let map = map.lock();
                Ok(map
                    .entries
                    .range(prefix.to_vec()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            }
        }
    }

    /// Every entry in the store, in key order.
    ///
    /// # Errors
    ///
    /// Propagates sled read failures.
    pub fn iter_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.scan_prefix(&[])
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.inner {
            Inner::Sled(db) => db.len(),
            Inner::Memory(map) => map.lock().entries.len(),
        }
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate resident size in bytes: on-disk footprint for sled,
    /// value-byte total for memory mode.
    #[must_use]
    pub fn approximate_size(&self) -> u64 {
        match &self.inner {
            Inner::Sled(db) => db.size_on_disk().unwrap_or(0),
            Inner::Memory(map) => map
                .lock()
                .entries
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum(),
        }
    }

    /// Drops every entry.
    ///
    /// # Errors
    ///
    /// Propagates sled failures.
    pub fn clear(&self) -> Result<(), StoreError> {
        match &self.inner {
            Inner::Sled(db) => {
                db.clear()?;
                Ok(())
            }
            Inner::Memory(map) => {
                let mut map = map.lock();
                map.entries.clear();
                map.insertion_order.clear();
                Ok(())
            }
        }
    }

    /// Flushes buffered writes to disk. No-op in memory mode.
    ///
    /// # Errors
    ///
    /// Propagates sled flush failures.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let Inner::Sled(db) = &self.inner {
            db.flush()?;
        }
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn persistent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 100);
        assert!(!store.memory_mode());

        store.insert(b"alpha", b"1").unwrap();
        store.insert(b"beta", b"2").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.len(), 2);
        assert!(store.remove(b"alpha").unwrap());
        assert!(!store.remove(b"alpha").unwrap());
        assert_eq!(store.get(b"alpha").unwrap(), None);
    }

    #[test]
    fn prefix_scan_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 100);
        store.insert(b"resume_a_2", b"x").unwrap();
        store.insert(b"resume_a_1", b"y").unwrap();
        store.insert(b"dircache_a", b"z").unwrap();

        let hits = store.scan_prefix(b"resume_").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"resume_a_1".to_vec());
        assert_eq!(hits[1].0, b"resume_a_2".to_vec());
    }

    #[test]
    fn second_open_degrades_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let first = KvStore::open(dir.path(), 100);
        first.insert(b"k", b"v").unwrap();
        first.flush().unwrap();

        // The lock is held by `first`, so this open cannot be exclusive.
        let second = KvStore::open(dir.path(), 100);
        assert!(second.memory_mode());

        // Operations still work against the memory map.
        second.insert(b"mem", b"only").unwrap();
        assert_eq!(second.get(b"mem").unwrap(), Some(b"only".to_vec()));

        // After the first owner goes away a fresh open is persistent again.
        drop(first);
        drop(second);
        let third = KvStore::open(dir.path(), 100);
        assert!(!third.memory_mode());
        assert_eq!(third.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn memory_map_fifo_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::memory(dir.path(), 3);
        for i in 0..5u8 {
            store.insert(&[i], b"v").unwrap();
        }
        assert_eq!(store.len(), 3);
        // The two oldest were evicted.
        assert_eq!(store.get(&[0]).unwrap(), None);
        assert_eq!(store.get(&[1]).unwrap(), None);
        assert_eq!(store.get(&[4]).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn overwrite_does_not_grow_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::memory(dir.path(), 2);
        store.insert(b"a", b"1").unwrap();
        store.insert(b"a", b"2").unwrap();
        store.insert(b"b", b"1").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn clear_empties_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path(), 100);
        store.insert(b"a", b"1").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
