//! Persistent KV cache with TTL, priority-aware eviction, and a memory
//! fallback.
//!
//! Entries are versioned JSON records carrying the value plus access
//! statistics. `get` refreshes those statistics asynchronously so readers
//! never wait on a write. When the store outgrows its size cap, progressive
//! cleanup passes walk it back toward the target, never removing more than
//! 20% of the current bytes in one pass: a single giant eviction would be
//! user-visible as a backend stall.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::kv::{KvStore, StoreError};
use crate::config::{Config, EvictionPolicy};

/// Schema version for persisted entries.
const ENTRY_VERSION: u32 = 1;

/// A size check runs every this many operations.
const SIZE_CHECK_EVERY: u64 = 1000;

/// Ceiling on the share of current bytes one cleanup pass may remove.
const MAX_EVICTION_SHARE: f64 = 0.20;

/// A cleanup pass slower than this logs a warning.
const SLOW_PASS_THRESHOLD: Duration = Duration::from_secs(5);

/// A cleanup pass removing more entries than this logs a warning.
const LARGE_PASS_THRESHOLD: usize = 1000;

/// Entry priority, derived from the key's semantic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) enum Priority {
    /// Transient signed URLs; first to go.
    Low = 1,
    /// Directory listings and object metadata.
    Medium = 2,
    /// Path-resolution entries; losing these costs extra API walks.
    High = 3,
}

impl Priority {
    fn for_key(key: &str) -> Self {
        if key.starts_with("path_to_id_")
            || key.starts_with("parent_")
            || key.starts_with("file_id_")
            || key.starts_with("dircache_")
        {
            Self::High
        } else if key.starts_with("download_url_") {
            Self::Low
        } else {
            Self::Medium
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    version: u32,
    value: Vec<u8>,
    created_at: i64,
    expires_at: i64,
    access_count: u64,
    last_access: i64,
    priority: Priority,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Counter snapshot for the cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Reads that returned a live value.
    pub hits: u64,
    /// Reads that found nothing (or an expired entry).
    pub misses: u64,
    /// `hits / (hits + misses)`.
    pub hit_rate: f64,
    /// Approximate resident bytes.
    pub size_bytes: u64,
    /// Entries removed by cleanup passes since open.
    pub items_cleaned: u64,
    /// Whether the cache is running without persistence.
    pub memory_mode: bool,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    items_cleaned: AtomicU64,
}

/// TTL'd, size-capped KV cache shared by the directory cache and the
/// download-URL plumbing.
#[derive(Debug)]
pub struct PersistentKvCache {
    store: Arc<KvStore>,
    counters: Arc<Counters>,
    default_ttl: Duration,
    max_size: u64,
    target_size: u64,
    policy: EvictionPolicy,
    ops: AtomicU64,
    cleanup_running: Arc<AtomicBool>,
}

impl PersistentKvCache {
    /// Opens the cache under `<cache_dir>/kv`. Lock contention degrades to
    /// memory mode; a failed open also schedules an immediate size check
    /// once the store is usable.
    #[must_use]
    pub fn open(config: &Config) -> Self {
        Self::open_at(&config.cache_dir.join("kv"), config)
    }

    /// Opens the cache at an explicit path.
    #[must_use]
    pub fn open_at(path: &Path, config: &Config) -> Self {
        let store = Arc::new(KvStore::open(path, config.memory_cache_cap));
        if store.memory_mode() {
            warn!(
                path = %path.display(),
                "kv cache running in memory mode; entries will not survive restart"
            );
        }
        Self {
            store,
            counters: Arc::new(Counters::default()),
            default_ttl: config.cache_ttl,
            max_size: config.max_cache_size,
            target_size: config.target_cache_size,
            policy: config.eviction_policy,
            ops: AtomicU64::new(0),
            cleanup_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stores `value` under `key` for `ttl` (the configured default when
    /// `None`).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = now_unix();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            version: ENTRY_VERSION,
            value: value.to_vec(),
            created_at: now,
            expires_at: now + ttl.as_secs() as i64,
            access_count: 0,
            last_access: now,
            priority: Priority::for_key(key),
        };
        let encoded =
            serde_json::to_vec(&entry).map_err(|e| StoreError::corrupt(key, e))?;
        self.store.insert(key.as_bytes(), &encoded)?;
        self.tick_ops();
        Ok(())
    }

    /// Reads a live value. Expired entries count as misses and are removed
    /// in passing. Access statistics are refreshed on a background task.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; a corrupt entry reads as a miss.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.tick_ops();
        let Some(raw) = self.store.get(key.as_bytes())? else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let now = now_unix();
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key, error = %e, "dropping undecodable cache entry");
                let _ = self.store.remove(key.as_bytes());
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if entry.version != ENTRY_VERSION || entry.is_expired(now) {
            let _ = self.store.remove(key.as_bytes());
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let value = entry.value.clone();

        // Touch access statistics off the read path. Lost updates under
        // concurrent eviction are acceptable.
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        tokio::spawn(async move {
            touch_entry(&store, &key_owned, entry);
        });

        Ok(Some(value))
    }

    /// Removes a key. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(key.as_bytes())?;
        self.tick_ops();
        Ok(())
    }

    /// Removes every key starting with `prefix`. Returns how many went.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.store.scan_prefix(prefix.as_bytes())?;
        let count = keys.len();
        for (key, _) in keys {
            self.store.remove(&key)?;
        }
        Ok(count)
    }

    /// Drops everything.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear()
    }

    /// Every key currently present (including not-yet-collected expired
    /// ones).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .iter_all()?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    /// Keys under a namespace prefix.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn get_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size_bytes: self.store.approximate_size(),
            items_cleaned: self.counters.items_cleaned.load(Ordering::Relaxed),
            memory_mode: self.store.memory_mode(),
        }
    }

    /// Flushes buffered writes.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn close(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    /// Runs one cleanup pass right now (also used by tests). Normally the
    /// operation counter triggers this in the background.
    pub fn run_cleanup(&self) {
        cleanup_pass(
            &self.store,
            &self.counters,
            self.policy,
            self.max_size,
            self.target_size,
        );
    }

    fn tick_ops(&self) {
        let ops = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops % SIZE_CHECK_EVERY != 0 {
            return;
        }
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.cleanup_running);
        let (policy, max, target) = (self.policy, self.max_size, self.target_size);
        tokio::spawn(async move {
            cleanup_pass(&store, &counters, policy, max, target);
            running.store(false, Ordering::Release);
        });
    }
}

fn touch_entry(store: &KvStore, key: &str, mut entry: CacheEntry) {
    entry.access_count += 1;
    entry.last_access = now_unix();
    if let Ok(encoded) = serde_json::to_vec(&entry) {
        // The entry may have been evicted meanwhile; re-inserting a live
        // value is harmless either way.
        let _ = store.insert(key.as_bytes(), &encoded);
    }
}

fn cleanup_pass(
    store: &KvStore,
    counters: &Counters,
    policy: EvictionPolicy,
    max_size: u64,
    target_size: u64,
) {
    let started = Instant::now();
    let now = now_unix();

    if policy == EvictionPolicy::Clear {
        let removed = store.len();
        let _ = store.clear();
        counters
            .items_cleaned
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(removed, "cache flushed (clear policy)");
        return;
    }

    let Ok(all) = store.iter_all() else { return };

    struct Candidate {
        key: Vec<u8>,
        bytes: u64,
        created_at: i64,
        last_access: i64,
        priority: Priority,
        expired: bool,
    }

    let mut total_bytes = 0u64;
    let mut candidates = Vec::with_capacity(all.len());
    for (key, raw) in all {
        let bytes = (key.len() + raw.len()) as u64;
        total_bytes += bytes;
        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) => candidates.push(Candidate {
                key,
                bytes,
                created_at: entry.created_at,
                last_access: entry.last_access,
                priority: entry.priority,
                expired: entry.is_expired(now),
            }),
            // Undecodable entries are treated as expired.
            Err(_) => candidates.push(Candidate {
                key,
                bytes,
                created_at: 0,
                last_access: 0,
                priority: Priority::Low,
                expired: true,
            }),
        }
    }

    if total_bytes <= max_size {
        return;
    }

    // Expired entries go first regardless of policy; live candidates are
    // ordered by the configured policy behind them.
    candidates.sort_by(|a, b| {
        b.expired.cmp(&a.expired).then_with(|| match policy {
            EvictionPolicy::Lru => a.last_access.cmp(&b.last_access),
            EvictionPolicy::PriorityLru => a
                .priority
                .cmp(&b.priority)
                .then(a.last_access.cmp(&b.last_access)),
            EvictionPolicy::Size | EvictionPolicy::Time | EvictionPolicy::Clear => {
                a.created_at.cmp(&b.created_at)
            }
        })
    });

    let over_target = total_bytes.saturating_sub(target_size);
    let pass_cap = (total_bytes as f64 * MAX_EVICTION_SHARE) as u64;
    let budget = over_target.min(pass_cap.max(1));

    let mut reclaimed = 0u64;
    let mut removed = 0usize;
    for candidate in &candidates {
        if reclaimed >= budget {
            break;
        }
        if store.remove(&candidate.key).unwrap_or(false) {
            reclaimed += candidate.bytes;
            removed += 1;
        }
    }

    counters
        .items_cleaned
        .fetch_add(removed as u64, Ordering::Relaxed);

    let elapsed = started.elapsed();
    if elapsed > SLOW_PASS_THRESHOLD || removed > LARGE_PASS_THRESHOLD {
        warn!(
            removed,
            reclaimed_bytes = reclaimed,
            elapsed_ms = elapsed.as_millis(),
            "cache cleanup pass was unusually heavy"
        );
    } else {
        debug!(
            removed,
            reclaimed_bytes = reclaimed,
            elapsed_ms = elapsed.as_millis(),
            total_bytes,
            "cache cleanup pass finished"
        );
    }
}
