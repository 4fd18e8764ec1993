//! Persistent resume state for chunked downloads.
//!
//! Each transfer gets a [`ResumeRecord`] keyed by a deterministic task id,
//! so a restarted process finds its previous progress without carrying any
//! state. Records live 24 hours; a periodic cleanup collects the stale and
//! the unparseable, and a sentinel health check keeps an eye on the store
//! itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::kv::{KvStore, StoreError};
use crate::backend::Backend;
use crate::config::Config;

/// Schema version for persisted resume records.
const RECORD_VERSION: u32 = 1;

/// Records older than this are expired.
const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval between sentinel health checks.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Consecutive health-check failures before the counter resets.
const HEALTH_FAILURE_LIMIT: u32 = 3;

/// Interval between cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Nominal throughput used to express resumed bytes as saved time.
const NOMINAL_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;

/// Derives the stable task id for `(backend, remote_path, size)`.
///
/// Equal inputs produce equal ids across runs; that is what lets a
/// restarted download find its record. The id leaks the path and size, so
/// records must never leave the process's own cache directory.
#[must_use]
pub fn derive_task_id(backend: Backend, remote_path: &str, size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend.tag().as_bytes());
    hasher.update(b"|");
    hasher.update(remote_path.as_bytes());
    hasher.update(b"|");
    hasher.update(size.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Durable snapshot of one chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// Schema version.
    pub version: u32,
    /// Deterministic task id.
    pub task_id: String,
    /// Leaf file name.
    pub file_name: String,
    /// Object size in bytes.
    pub file_size: u64,
    /// Remote path of the object.
    pub file_path: String,
    /// Chunk size used when the task was created.
    pub chunk_size: u64,
    /// `ceil(file_size / chunk_size)`.
    pub total_chunks: u32,
    /// Completed chunk indices. Serialized as `{index: true}`.
    pub completed_chunks: HashMap<u32, bool>,
    /// Creation time (unix seconds).
    pub created_at: i64,
    /// Last mutation time (unix seconds).
    pub last_updated: i64,
    /// Temp file holding the partial download, when one was recorded.
    pub temp_file_path: Option<String>,
    /// Free-form backend-specific values.
    #[serde(default)]
    pub backend_specific_data: HashMap<String, String>,
}

impl ResumeRecord {
    /// Creates a fresh record for a transfer.
    #[must_use]
    pub fn new(
        backend: Backend,
        remote_path: &str,
        file_name: &str,
        file_size: u64,
        chunk_size: u64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        let total_chunks = if file_size == 0 || chunk_size == 0 {
            0
        } else {
            file_size.div_ceil(chunk_size) as u32
        };
        Self {
            version: RECORD_VERSION,
            task_id: derive_task_id(backend, remote_path, file_size),
            file_name: file_name.to_string(),
            file_size,
            file_path: remote_path.to_string(),
            chunk_size,
            total_chunks,
            completed_chunks: HashMap::new(),
            created_at: now,
            last_updated: now,
            temp_file_path: None,
            backend_specific_data: HashMap::new(),
        }
    }

    /// Number of chunks marked complete.
    #[must_use]
    pub fn completed_count(&self) -> u32 {
        self.completed_chunks.len() as u32
    }

    /// Bytes covered by the completed chunks.
    #[must_use]
    pub fn completed_bytes(&self) -> u64 {
        self.completed_chunks
            .keys()
            .map(|&i| self.chunk_len(i))
            .sum()
    }

    /// Length of chunk `i` (the final chunk may be short).
    #[must_use]
    pub fn chunk_len(&self, i: u32) -> u64 {
        let start = u64::from(i) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        end.saturating_sub(start)
    }

    fn is_expired(&self, now: i64) -> bool {
        now - self.created_at > RECORD_TTL.as_secs() as i64
    }
}

/// Monotonic counters describing resume activity.
#[derive(Debug, Clone, Default)]
pub struct ResumeStats {
    /// Successful saves.
    pub saves: u64,
    /// Loads that found a usable record.
    pub resumes: u64,
    /// Failures keyed by classified reason.
    pub failures: HashMap<String, u64>,
    /// Estimated bytes that did not need re-downloading.
    pub bytes_resumed: u64,
    /// `bytes_resumed` expressed as saved transfer time at a nominal rate.
    pub seconds_saved: u64,
    /// When this store was opened (unix seconds).
    pub opened_at: i64,
    /// Last save or load (unix seconds).
    pub last_activity: i64,
}

#[derive(Debug, Default)]
struct StatCells {
    saves: AtomicU64,
    resumes: AtomicU64,
    bytes_resumed: AtomicU64,
    last_activity: AtomicU64,
    failures: RwLock<HashMap<String, u64>>,
}

impl StatCells {
    fn record_failure(&self, reason: &str) {
        *self.failures.write().entry(reason.to_string()).or_insert(0) += 1;
    }

    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp() as u64, Ordering::Relaxed);
    }
}

/// Persisted per-task chunk-completion state with health monitoring.
#[derive(Debug)]
pub struct ResumeStore {
    store: Arc<KvStore>,
    backend: Backend,
    stats: Arc<StatCells>,
    opened_at: i64,
    health_failures: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ResumeStore {
    /// Opens the store under `<cache_dir>/resume/<backend>` and starts the
    /// health-check and cleanup loops. Must be called from a tokio runtime.
    #[must_use]
    pub fn open(backend: Backend, config: &Config) -> Arc<Self> {
        let path = config.cache_dir.join("resume").join(backend.tag());
        Self::open_at(&path, backend, config)
    }

    /// Opens the store at an explicit path.
    #[must_use]
    pub fn open_at(path: &Path, backend: Backend, config: &Config) -> Arc<Self> {
        let store = Arc::new(KvStore::open(path, config.memory_cache_cap));
        if store.memory_mode() {
            warn!(
                backend = %backend,
                "resume store in memory mode; resume state will not survive restart"
            );
        }

        let this = Arc::new(Self {
            store,
            backend,
            stats: Arc::new(StatCells::default()),
            opened_at: chrono::Utc::now().timestamp(),
            health_failures: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        });

        this.spawn_health_loop();
        this.spawn_cleanup_loop();
        this
    }

    fn key(&self, task_id: &str) -> String {
        format!("resume_{}_{}", self.backend.tag(), task_id)
    }

    /// Persists a record. Idempotent per task id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn save(&self, record: &ResumeRecord) -> Result<(), StoreError> {
        let mut record = record.clone();
        record.last_updated = chrono::Utc::now().timestamp();
        let encoded = serde_json::to_vec(&record)
            .map_err(|e| StoreError::corrupt(&record.task_id, e))?;
        self.store.insert(self.key(&record.task_id).as_bytes(), &encoded)?;
        self.stats.saves.fetch_add(1, Ordering::Relaxed);
        self.stats.touch();
        Ok(())
    }

    /// Loads a record if one exists and is still within its TTL.
    ///
    /// A hit counts toward the resume statistics, crediting
    /// `file_size * completed / total` as resumed bytes (an estimate for
    /// reporting; correctness never depends on it).
    ///
    /// # Errors
    ///
    /// Propagates storage failures; expired and corrupt records read as
    /// `None` and are deleted in passing.
    pub fn load(&self, task_id: &str) -> Result<Option<ResumeRecord>, StoreError> {
        let key = self.key(task_id);
        let Some(raw) = self.store.get(key.as_bytes())? else {
            return Ok(None);
        };

        let record: ResumeRecord = match serde_json::from_slice(&raw) {
            Ok(r) => r,
            Err(e) => {
                debug!(task_id, error = %e, "deleting unparseable resume record");
                self.stats.record_failure("corrupt_record");
                let _ = self.store.remove(key.as_bytes());
                return Ok(None);
            }
        };

        let now = chrono::Utc::now().timestamp();
        if record.version != RECORD_VERSION || record.is_expired(now) {
            debug!(task_id, "resume record expired");
            self.stats.record_failure("expired");
            let _ = self.store.remove(key.as_bytes());
            return Ok(None);
        }

        if record.total_chunks > 0 {
            let resumed = record.file_size * u64::from(record.completed_count())
                / u64::from(record.total_chunks);
            self.stats.bytes_resumed.fetch_add(resumed, Ordering::Relaxed);
        }
        self.stats.resumes.fetch_add(1, Ordering::Relaxed);
        self.stats.touch();
        Ok(Some(record))
    }

    /// Removes a record. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete(&self, task_id: &str) -> Result<(), StoreError> {
        self.store.remove(self.key(task_id).as_bytes())?;
        Ok(())
    }

    /// Marks chunk `index` complete. Idempotent; out-of-range indices are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Propagates storage failures. Unknown tasks are a no-op.
    pub fn mark_chunk_completed(&self, task_id: &str, index: u32) -> Result<(), StoreError> {
        let Some(mut record) = self.load_silent(task_id)? else {
            return Ok(());
        };
        if index >= record.total_chunks {
            warn!(task_id, index, total = record.total_chunks, "chunk index out of range");
            return Ok(());
        }
        record.completed_chunks.insert(index, true);
        self.save(&record)
    }

    /// Whether chunk `index` is recorded complete.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn is_chunk_completed(&self, task_id: &str, index: u32) -> Result<bool, StoreError> {
        Ok(self
            .load_silent(task_id)?
            .is_some_and(|r| r.completed_chunks.contains_key(&index)))
    }

    /// `(completed, total, percent)` for a task. Unknown tasks report
    /// zeros.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn progress(&self, task_id: &str) -> Result<(u32, u32, f64), StoreError> {
        let Some(record) = self.load_silent(task_id)? else {
            return Ok((0, 0, 0.0));
        };
        let completed = record.completed_count();
        let total = record.total_chunks;
        let percent = if total == 0 {
            0.0
        } else {
            f64::from(completed) * 100.0 / f64::from(total)
        };
        Ok((completed, total, percent))
    }

    /// Deletes every expired or unparseable record for this backend.
    /// Returns how many were removed. Safe against concurrent writers.
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the scan itself.
    pub fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let prefix = format!("resume_{}_", self.backend.tag());
        let now = chrono::Utc::now().timestamp();
        let mut removed = 0usize;
        for (key, raw) in self.store.scan_prefix(prefix.as_bytes())? {
            let stale = match serde_json::from_slice::<ResumeRecord>(&raw) {
                Ok(record) => record.is_expired(now),
                // Malformed records are considered expired.
                Err(_) => true,
            };
            if stale && self.store.remove(&key).unwrap_or(false) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(backend = %self.backend, removed, "cleaned expired resume records");
        }
        Ok(removed)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ResumeStats {
        let bytes_resumed = self.stats.bytes_resumed.load(Ordering::Relaxed);
        ResumeStats {
            saves: self.stats.saves.load(Ordering::Relaxed),
            resumes: self.stats.resumes.load(Ordering::Relaxed),
            failures: self.stats.failures.read().clone(),
            bytes_resumed,
            seconds_saved: bytes_resumed / NOMINAL_BYTES_PER_SEC,
            opened_at: self.opened_at,
            last_activity: self.stats.last_activity.load(Ordering::Relaxed) as i64,
        }
    }

    /// Operational health snapshot.
    #[must_use]
    pub fn health_report(&self) -> HashMap<String, String> {
        let mut report = HashMap::new();
        report.insert("backend".to_string(), self.backend.tag().to_string());
        report.insert(
            "memory_mode".to_string(),
            self.store.memory_mode().to_string(),
        );
        report.insert("entries".to_string(), self.store.len().to_string());
        report.insert(
            "consecutive_health_failures".to_string(),
            self.health_failures.load(Ordering::Relaxed).to_string(),
        );
        report.insert(
            "path".to_string(),
            self.store.path().display().to_string(),
        );
        report
    }

    /// Stops the background loops and flushes.
    ///
    /// # Errors
    ///
    /// Propagates storage flush failures.
    pub fn close(&self) -> Result<(), StoreError> {
        self.cancel.cancel();
        self.store.flush()
    }

    /// Load without touching resume statistics (internal mutation path).
    fn load_silent(&self, task_id: &str) -> Result<Option<ResumeRecord>, StoreError> {
        let key = self.key(task_id);
        let Some(raw) = self.store.get(key.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ResumeRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(_) => Ok(None),
        }
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        // Holding only a weak reference keeps the store (and its sled
        // lock) droppable while the loop sleeps.
        let this = Arc::downgrade(self);
        let failures = Arc::clone(&self.health_failures);
        let cancel = self.cancel.clone();
        let backend = self.backend;
        tokio::spawn(async move {
            let sentinel_key = format!("resume_{}_health_sentinel", backend.tag());
            loop {
                tokio::select! {
                    () = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                    () = cancel.cancelled() => return,
                }
                let Some(store) = this.upgrade() else { return };
                let store = &store.store;

                let ok = store.insert(sentinel_key.as_bytes(), b"ok").is_ok()
                    && matches!(store.get(sentinel_key.as_bytes()), Ok(Some(_)))
                    && store.remove(sentinel_key.as_bytes()).is_ok();

                if ok {
                    failures.store(0, Ordering::Relaxed);
                } else {
                    let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(backend = %backend, count, "resume store health check failed");
                    if count >= u64::from(HEALTH_FAILURE_LIMIT) {
                        warn!(
                            backend = %backend,
                            "resume store unhealthy; resetting failure counter, \
                             persistence resumes at next open"
                        );
                        failures.store(0, Ordering::Relaxed);
                    }
                }
            }
        });
    }

    fn spawn_cleanup_loop(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                    () = cancel.cancelled() => return,
                }
                let Some(store) = this.upgrade() else { return };
                if let Err(e) = store.cleanup_expired() {
                    warn!(error = %e, "resume cleanup pass failed");
                }
            }
        });
    }
}

impl Drop for ResumeStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
