//! Bidirectional path ↔ directory-id cache.
//!
//! The drives address directories by opaque ids while the framework speaks
//! paths, so every operation starts with a path resolution. This cache
//! memoizes `path ↔ id` both ways, discovers its root lazily by walking
//! from the true root, and optionally persists its maps through the KV
//! cache so warm starts skip the walk entirely.
//!
//! Invalidations on move are deliberately late: `flush_dir` runs after a
//! successful move, never before, because a failed move must not throw away
//! ids that are still valid. A reader holding a stale id simply gets
//! `NotFound` from the backend and re-resolves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::cache::PersistentKvCache;
use super::kv::StoreError;
use crate::backend::Backend;

/// Errors from directory resolution.
#[derive(Debug, Error)]
pub enum DirCacheError {
    /// A path segment does not exist and creation was not requested.
    #[error("directory not found: {path}")]
    NotFound {
        /// The path that failed to resolve.
        path: String,
    },

    /// The move destination already exists.
    #[error("destination already exists: {path}")]
    DestinationExists {
        /// The conflicting destination path.
        path: String,
    },

    /// Root cannot be moved onto root.
    #[error("cannot move root onto root")]
    RootMove,

    /// The backend refused a lookup or create.
    #[error("backend error resolving {path}: {message}")]
    Backend {
        /// The path being resolved.
        path: String,
        /// Backend-reported message.
        message: String,
    },

    /// Persistence trouble (non-fatal for resolution itself).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-segment directory operations supplied by the backend integration.
#[async_trait]
pub trait DirOps: Send + Sync {
    /// Finds a child directory by name under `parent_id`. Returns its id,
    /// or `None` when no such child exists.
    async fn lookup_segment(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DirCacheError>;

    /// Creates a child directory under `parent_id` and returns its id.
    async fn create_segment(&self, parent_id: &str, name: &str)
    -> Result<String, DirCacheError>;
}

/// Everything `dir_move` needs to issue the backend move call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    /// Id of the directory being moved.
    pub src_id: String,
    /// Id of its current parent.
    pub src_parent_id: String,
    /// Its current leaf name.
    pub src_leaf: String,
    /// Id of the destination parent (intermediates created).
    pub dst_parent_id: String,
    /// The new leaf name.
    pub dst_leaf: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Maps {
    path_to_id: HashMap<String, String>,
    id_to_path: HashMap<String, String>,
}

impl Maps {
    fn put(&mut self, path: &str, id: &str) {
        self.path_to_id.insert(path.to_string(), id.to_string());
        self.id_to_path.insert(id.to_string(), path.to_string());
    }

    fn flush_prefix(&mut self, prefix: &str) {
        let doomed: Vec<String> = self
            .path_to_id
            .keys()
            .filter(|p| {
                *p == prefix || p.starts_with(&format!("{prefix}/")) || prefix.is_empty()
            })
            .cloned()
            .collect();
        for path in doomed {
            if let Some(id) = self.path_to_id.remove(&path) {
                self.id_to_path.remove(&id);
            }
        }
    }
}

/// Bidirectional `path ↔ id` cache rooted at a subpath of the remote.
pub struct DirIdCache {
    backend: Backend,
    /// Subpath of the remote this cache is rooted at ("" = true root).
    root_path: String,
    /// Id of the drive's true root.
    true_root_id: String,
    /// Resolved id of `root_path`, once discovered.
    root_id: Mutex<Option<String>>,
    maps: Arc<Mutex<Maps>>,
    ops: Arc<dyn DirOps>,
    persistence: Option<Arc<PersistentKvCache>>,
}

impl std::fmt::Debug for DirIdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirIdCache")
            .field("backend", &self.backend)
            .field("root_path", &self.root_path)
            .finish_non_exhaustive()
    }
}

impl DirIdCache {
    /// Creates a cache for `root_path`, resolving lazily via `ops`.
    /// When `persistence` is supplied, a previously saved snapshot is
    /// loaded immediately and every `put` is persisted in the background.
    #[must_use]
    pub fn new(
        backend: Backend,
        root_path: &str,
        true_root_id: &str,
        ops: Arc<dyn DirOps>,
        persistence: Option<Arc<PersistentKvCache>>,
    ) -> Self {
        let cache = Self {
            backend,
            root_path: root_path.trim_matches('/').to_string(),
            true_root_id: true_root_id.to_string(),
            root_id: Mutex::new(None),
            maps: Arc::new(Mutex::new(Maps::default())),
            ops,
            persistence,
        };
        cache.load_snapshot();
        cache
    }

    fn snapshot_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.root_path.as_bytes());
        let hash = hex::encode(&hasher.finalize()[..8]);
        format!("dircache_{}_{}", self.backend.tag(), hash)
    }

    fn load_snapshot(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match persistence.get(&self.snapshot_key()) {
            Ok(Some(raw)) => match serde_json::from_slice::<Maps>(&raw) {
                Ok(maps) => {
                    let loaded = maps.path_to_id.len();
                    *self.maps.lock() = maps;
                    debug!(backend = %self.backend, loaded, "loaded directory cache snapshot");
                }
                Err(e) => warn!(error = %e, "ignoring undecodable directory cache snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "directory cache snapshot read failed"),
        }
    }

    /// Serializes the maps on a background task; readers are never blocked
    /// by persistence.
    fn persist_async(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let persistence = Arc::clone(persistence);
        let maps = Arc::clone(&self.maps);
        let key = self.snapshot_key();
        tokio::spawn(async move {
            let encoded = {
                let maps = maps.lock();
                serde_json::to_vec(&*maps)
            };
            match encoded {
                Ok(raw) => {
                    if let Err(e) = persistence.set(&key, &raw, None) {
                        warn!(error = %e, "directory cache snapshot write failed");
                    }
                }
                Err(e) => warn!(error = %e, "directory cache snapshot encode failed"),
            }
        });
    }

    /// Cached id for `path`, if known.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<String> {
        self.maps.lock().path_to_id.get(normalize(path).as_str()).cloned()
    }

    /// Cached path for `id`, if known.
    #[must_use]
    pub fn get_inv(&self, id: &str) -> Option<String> {
        self.maps.lock().id_to_path.get(id).cloned()
    }

    /// Records `path ↔ id` and schedules a snapshot write.
    pub fn put(&self, path: &str, id: &str) {
        self.maps.lock().put(&normalize(path), id);
        self.persist_async();
    }

    /// Resolves (and memoizes) the id of the cache root, walking from the
    /// true root and creating missing segments when `create` is set.
    ///
    /// # Errors
    ///
    /// [`DirCacheError::NotFound`] when a segment is missing and `create`
    /// is false; backend errors pass through.
    pub async fn root(&self, create: bool) -> Result<String, DirCacheError> {
        if let Some(id) = self.root_id.lock().clone() {
            return Ok(id);
        }
        let mut current = self.true_root_id.clone();
        if !self.root_path.is_empty() {
            for segment in self.root_path.split('/') {
                current = self.resolve_segment(&current, segment, create, &self.root_path).await?;
            }
        }
        *self.root_id.lock() = Some(current.clone());
        Ok(current)
    }

    /// Resolves `path` (relative to the cache root) to a directory id,
    /// walking segment by segment with per-segment memoization. Missing
    /// segments are created when `create` is set.
    ///
    /// # Errors
    ///
    /// [`DirCacheError::NotFound`] for missing segments without `create`;
    /// backend errors pass through.
    pub async fn find_dir(&self, path: &str, create: bool) -> Result<String, DirCacheError> {
        let path = normalize(path);
        if path.is_empty() {
            return self.root(create).await;
        }
        if let Some(id) = self.get(&path) {
            trace!(%path, %id, "directory cache hit");
            return Ok(id);
        }

        let mut current = self.root(create).await?;
        let mut walked = String::new();
        for segment in path.split('/') {
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(segment);

            if let Some(id) = self.get(&walked) {
                current = id;
                continue;
            }
            current = self.resolve_segment(&current, segment, create, &walked).await?;
            self.put(&walked, &current);
        }
        Ok(current)
    }

    /// Splits `path` into `(leaf, parent_id)`, resolving (and optionally
    /// creating) the parent directory.
    ///
    /// # Errors
    ///
    /// Same as [`find_dir`](Self::find_dir).
    pub async fn find_path(
        &self,
        path: &str,
        create: bool,
    ) -> Result<(String, String), DirCacheError> {
        let path = normalize(path);
        let (parent, leaf) = match path.rsplit_once('/') {
            Some((parent, leaf)) => (parent.to_string(), leaf.to_string()),
            None => (String::new(), path.clone()),
        };
        let parent_id = self.find_dir(&parent, create).await?;
        Ok((leaf, parent_id))
    }

    /// Invalidates `prefix` and every descendant.
    pub fn flush_dir(&self, prefix: &str) {
        self.maps.lock().flush_prefix(&normalize(prefix));
        self.persist_async();
    }

    /// Clears the whole cache.
    pub fn flush(&self) {
        let mut maps = self.maps.lock();
        maps.path_to_id.clear();
        maps.id_to_path.clear();
        drop(maps);
        self.persist_async();
    }

    /// Forgets the resolved root id, reverting to the true root on the
    /// next resolution.
    pub fn reset_root(&self) {
        *self.root_id.lock() = None;
        self.flush();
    }

    /// Plans a directory move from `src_remote` (resolved against
    /// `src_cache`) to `dst_remote` (resolved against `self`), creating
    /// destination intermediates.
    ///
    /// Refuses root-to-root moves and existing destinations. The caller
    /// performs the backend move and then invalidates with `flush_dir`;
    /// flushing only after success keeps ids valid if the move fails.
    ///
    /// # Errors
    ///
    /// [`DirCacheError::RootMove`], [`DirCacheError::DestinationExists`],
    /// or resolution errors.
    pub async fn dir_move(
        &self,
        src_cache: &DirIdCache,
        src_remote: &str,
        dst_remote: &str,
    ) -> Result<MovePlan, DirCacheError> {
        let src_remote = normalize(src_remote);
        let dst_remote = normalize(dst_remote);
        if src_remote.is_empty() && dst_remote.is_empty() {
            return Err(DirCacheError::RootMove);
        }

        if self.find_dir(&dst_remote, false).await.is_ok() {
            return Err(DirCacheError::DestinationExists { path: dst_remote });
        }

        let src_id = src_cache.find_dir(&src_remote, false).await?;
        let (src_leaf, src_parent_id) = src_cache.find_path(&src_remote, false).await?;
        let (dst_leaf, dst_parent_id) = self.find_path(&dst_remote, true).await?;

        Ok(MovePlan {
            src_id,
            src_parent_id,
            src_leaf,
            dst_parent_id,
            dst_leaf,
        })
    }

    async fn resolve_segment(
        &self,
        parent_id: &str,
        segment: &str,
        create: bool,
        full_path: &str,
    ) -> Result<String, DirCacheError> {
        if let Some(id) = self.ops.lookup_segment(parent_id, segment).await? {
            return Ok(id);
        }
        if create {
            debug!(path = full_path, segment, "creating missing directory segment");
            return self.ops.create_segment(parent_id, segment).await;
        }
        Err(DirCacheError::NotFound {
            path: full_path.to_string(),
        })
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}
