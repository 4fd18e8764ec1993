//! Persistent state: resume records, the KV cache, and the directory-ID
//! cache.
//!
//! All three sit on [`kv::KvStore`], a thin wrapper over an embedded sled
//! tree that degrades to a bounded in-memory map when another process holds
//! the store lock. Degraded mode keeps the same surface; only durability is
//! lost, and every store reports it through its `stats()`.

pub mod cache;
pub mod dircache;
pub mod kv;
pub mod resume;

pub use cache::{CacheStats, PersistentKvCache};
pub use dircache::{DirCacheError, DirIdCache, DirOps, MovePlan};
pub use kv::{KvStore, StoreError};
pub use resume::{ResumeRecord, ResumeStats, ResumeStore, derive_task_id};
