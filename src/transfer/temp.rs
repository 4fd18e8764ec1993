//! Refcounted temp-file registry.
//!
//! A finished download registers its temp file under the source's identity
//! key. Later transfers of the same source take a read handle and bump the
//! refcount instead of downloading again. The refcount is the only
//! coordination mechanism: a file is deletable only at refcount zero after
//! sitting idle past the age limit, and its contents never change once the
//! initial write completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::TransferError;
use crate::backend::Backend;

/// Builds the identity key for a source object.
#[must_use]
pub fn source_key(backend: Backend, src_remote: &str, size: u64, mod_time_unix: i64) -> String {
    format!(
        "{}|{}|{}|{}",
        backend.tag(),
        urlencoding::encode(src_remote),
        size,
        mod_time_unix
    )
}

#[derive(Debug)]
struct TempRecord {
    path: PathBuf,
    size: u64,
    digest: String,
    created: Instant,
    last_accessed: Instant,
    refcount: u32,
}

/// Read handle over a registered temp file. Dropping it releases the
/// refcount.
#[derive(Debug)]
pub struct TempFileHandle {
    path: PathBuf,
    key: String,
    records: Arc<Mutex<HashMap<String, TempRecord>>>,
}

impl TempFileHandle {
    /// Path of the shared temp file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the file for reading.
    ///
    /// # Errors
    ///
    /// [`TransferError::Io`] when the file cannot be opened.
    pub async fn open(&self) -> Result<tokio::fs::File, TransferError> {
        tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| TransferError::Io {
                path: self.path.clone(),
                source: e,
            })
    }
}

impl Drop for TempFileHandle {
    fn drop(&mut self) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&self.key) {
            record.refcount = record.refcount.saturating_sub(1);
            record.last_accessed = Instant::now();
            debug!(key = %self.key, refcount = record.refcount, "temp file handle released");
        }
    }
}

/// Registry of finished temp files keyed by source identity.
#[derive(Debug)]
pub struct TempFileRegistry {
    records: Arc<Mutex<HashMap<String, TempRecord>>>,
    max_age: Duration,
}

impl TempFileRegistry {
    /// Creates a registry whose cleanup pass deletes files idle longer
    /// than `max_age`.
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            max_age,
        }
    }

    /// Registers a freshly written temp file with refcount 1 and returns
    /// the writer's own handle.
    #[must_use]
    pub fn register(&self, key: &str, path: &Path, size: u64, digest: &str) -> TempFileHandle {
        let now = Instant::now();
        self.records.lock().insert(
            key.to_string(),
            TempRecord {
                path: path.to_path_buf(),
                size,
                digest: digest.to_string(),
                created: now,
                last_accessed: now,
                refcount: 1,
            },
        );
        debug!(key, path = %path.display(), size, "temp file registered");
        TempFileHandle {
            path: path.to_path_buf(),
            key: key.to_string(),
            records: Arc::clone(&self.records),
        }
    }

    /// Looks up an existing download for `key`. On a hit the refcount is
    /// bumped atomically with the lookup and a handle returned. A record
    /// whose file has vanished or changed size is purged.
    #[must_use]
    pub fn check_existing(&self, key: &str, expected_size: u64) -> Option<TempFileHandle> {
        let mut records = self.records.lock();
        let record = records.get_mut(key)?;

        let on_disk = std::fs::metadata(&record.path).map(|m| m.len()).ok();
        if on_disk != Some(expected_size) || record.size != expected_size {
            warn!(
                key,
                expected = expected_size,
                found = ?on_disk,
                "registered temp file unusable; purging record"
            );
            records.remove(key);
            return None;
        }

        record.refcount += 1;
        record.last_accessed = Instant::now();
        debug!(key, refcount = record.refcount, "reusing existing download");
        Some(TempFileHandle {
            path: record.path.clone(),
            key: key.to_string(),
            records: Arc::clone(&self.records),
        })
    }

    /// Content digest recorded for `key`, when the record exists.
    #[must_use]
    pub fn digest(&self, key: &str) -> Option<String> {
        self.records.lock().get(key).map(|r| r.digest.clone())
    }

    /// Current refcount for `key` (0 when absent). For tests and stats.
    #[must_use]
    pub fn refcount(&self, key: &str) -> u32 {
        self.records.lock().get(key).map_or(0, |r| r.refcount)
    }

    /// Purges records (and deletes files) that are unreferenced and idle
    /// past the age limit. Returns how many files went.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut doomed = Vec::new();
        {
            let mut records = self.records.lock();
            records.retain(|key, record| {
                let keep = record.refcount > 0
                    || now.duration_since(record.last_accessed) <= self.max_age;
                if !keep {
                    doomed.push((key.clone(), record.path.clone()));
                }
                keep
            });
        }

        for (key, path) in &doomed {
            if let Err(e) = std::fs::remove_file(path) {
                // The file may already be gone; only log real failures.
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key, path = %path.display(), error = %e, "temp file removal failed");
                }
            }
        }
        if !doomed.is_empty() {
            info!(removed = doomed.len(), "temp file cleanup pass finished");
        }
        doomed.len()
    }

    /// Number of registered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Age of the oldest record, for health reporting.
    #[must_use]
    pub fn oldest_age(&self) -> Option<Duration> {
        let records = self.records.lock();
        records
            .values()
            .map(|r| r.created.elapsed())
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_temp(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn source_key_escapes_slashes() {
        let key = source_key(Backend::DriveA, "media/a movie.mkv", 100, 1700000000);
        assert!(!key.contains("media/a"));
        assert!(key.starts_with("drivea|"));
        assert!(key.ends_with("|100|1700000000"));
    }

    #[test]
    fn register_then_reuse_bumps_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "movie.part", b"0123456789");
        let registry = TempFileRegistry::new(Duration::from_secs(3600));

        let key = source_key(Backend::DriveA, "movie.mkv", 10, 1);
        let writer = registry.register(&key, &path, 10, "digest");
        assert_eq!(registry.refcount(&key), 1);

        let reader = registry.check_existing(&key, 10).unwrap();
        assert_eq!(registry.refcount(&key), 2);
        assert_eq!(reader.path(), path.as_path());

        drop(reader);
        assert_eq!(registry.refcount(&key), 1);
        drop(writer);
        assert_eq!(registry.refcount(&key), 0);
    }

    #[test]
    fn size_mismatch_purges_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "movie.part", b"0123456789");
        let registry = TempFileRegistry::new(Duration::from_secs(3600));
        let key = source_key(Backend::DriveA, "movie.mkv", 10, 1);
        drop(registry.register(&key, &path, 10, "digest"));

        // Caller expects a different size; the record is purged.
        assert!(registry.check_existing(&key, 11).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn missing_file_purges_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(dir.path(), "movie.part", b"0123456789");
        let registry = TempFileRegistry::new(Duration::from_secs(3600));
        let key = source_key(Backend::DriveA, "movie.mkv", 10, 1);
        drop(registry.register(&key, &path, 10, "digest"));

        std::fs::remove_file(&path).unwrap();
        assert!(registry.check_existing(&key, 10).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn cleanup_spares_referenced_and_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let held_path = write_temp(dir.path(), "held.part", b"aa");
        let idle_path = write_temp(dir.path(), "idle.part", b"bb");
        let registry = TempFileRegistry::new(Duration::ZERO);

        let held = registry.register("held", &held_path, 2, "d1");
        drop(registry.register("idle", &idle_path, 2, "d2"));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(registry.cleanup(), 1);
        assert!(held_path.exists());
        assert!(!idle_path.exists());
        drop(held);
    }
}
