//! The mounted projection: snapshot lifecycle, access-driven sync, and the
//! redirect-file view.
//!
//! A mount acquires a coarse lock file in its cache directory; losing that
//! race means another mount owns persistence and this one runs memory-only.
//! Cold starts list only the root, so mounting a huge remote costs one API
//! call. Everything deeper is filled in when (and if) it is accessed,
//! throttled by the refresh limiter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::snapshot::{FileEntry, ProjectionSnapshot, config_fingerprint};
use super::{DirectoryLister, ProjectionError, RemoteEntry};
use crate::backend::Backend;
use crate::config::Config;
use crate::limiter::RefreshLimiter;

/// Snapshot file name inside the cache directory.
const SNAPSHOT_FILE: &str = "projection.json";

/// Lock file name inside the cache directory.
const LOCK_FILE: &str = "mount.lock";

/// What a directory listing of the projection shows for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectedEntry {
    /// A video file, shown as a redirect file. The projected size is
    /// exactly the content length.
    Strm {
        /// Projected file name (`<stem>.strm`).
        name: String,
        /// Redirect content, no trailing newline.
        content: String,
    },
    /// A subdirectory.
    Directory {
        /// Directory name.
        name: String,
    },
    /// A non-video file large enough to show; projected as itself.
    Passthrough {
        /// File name.
        name: String,
        /// Size in bytes.
        size: u64,
    },
}

impl ProjectedEntry {
    /// The name this entry appears under.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Strm { name, .. } | Self::Directory { name } | Self::Passthrough { name, .. } => {
                name
            }
        }
    }
}

/// A mounted read-only projection of one remote subtree.
pub struct ProjectionCache {
    backend: Backend,
    remote_root: String,
    config: Config,
    snapshot: RwLock<ProjectionSnapshot>,
    snapshot_path: PathBuf,
    /// `None` when another mount holds the lock; persistence is disabled.
    lock_path: Option<PathBuf>,
    lister: Arc<dyn DirectoryLister>,
    refresh: Arc<RefreshLimiter>,
}

impl std::fmt::Debug for ProjectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionCache")
            .field("backend", &self.backend)
            .field("remote_root", &self.remote_root)
            .field("persistent", &self.lock_path.is_some())
            .finish_non_exhaustive()
    }
}

impl ProjectionCache {
    /// Mounts the projection: acquires the cache lock (or degrades),
    /// reuses a matching snapshot, and otherwise cold-starts with a
    /// root-only listing.
    ///
    /// # Errors
    ///
    /// Cache-directory creation and root-listing failures. Lock
    /// contention and snapshot corruption degrade instead of failing.
    #[instrument(skip(config, lister, refresh))]
    pub async fn mount(
        backend: Backend,
        remote_root: &str,
        config: Config,
        lister: Arc<dyn DirectoryLister>,
        refresh: Arc<RefreshLimiter>,
    ) -> Result<Self, ProjectionError> {
        let fingerprint = config_fingerprint(&config);
        let cache_dir = config.cache_dir.join("projection").join(format!(
            "{}_{}_{}",
            backend.tag(),
            urlencoding::encode(remote_root),
            fingerprint
        ));
        std::fs::create_dir_all(&cache_dir).map_err(|e| ProjectionError::Io {
            path: cache_dir.clone(),
            source: e,
        })?;

        let lock_path = acquire_lock(&cache_dir);
        if lock_path.is_none() {
            warn!(
                dir = %cache_dir.display(),
                "projection lock held elsewhere; running memory-only"
            );
        }

        let snapshot_path = cache_dir.join(SNAPSHOT_FILE);
        let snapshot = match ProjectionSnapshot::load(&snapshot_path) {
            Ok(snapshot) if snapshot.matches(backend, remote_root, &fingerprint) => {
                info!(files = snapshot.file_count, "reusing projection snapshot");
                Some(snapshot)
            }
            Ok(_) => {
                info!("snapshot fingerprint mismatch; rebuilding");
                None
            }
            Err(ProjectionError::Io { .. }) => None,
            Err(e) => {
                warn!(error = %e, "snapshot unreadable; rebuilding");
                None
            }
        };

        let cache = Self {
            backend,
            remote_root: remote_root.to_string(),
            snapshot: RwLock::new(snapshot.unwrap_or_else(|| {
                ProjectionSnapshot::new(backend, remote_root, &fingerprint, config.cache_ttl)
            })),
            snapshot_path,
            lock_path,
            lister,
            refresh,
            config,
        };

        if cache.snapshot.read().directories.is_empty() {
            // Cold start: one listing, no recursion, bounded API cost.
            cache.populate_root().await?;
        }
        Ok(cache)
    }

    async fn populate_root(&self) -> Result<(), ProjectionError> {
        debug!("cold start: root-only listing");
        self.refresh.record_api_call();
        let entries = self.lister.list_directory("").await?;
        {
            let mut snapshot = self.snapshot.write();
            let root = snapshot.directory_mut("");
            apply_listing(root, &entries);
            for entry in &entries {
                if entry.is_dir {
                    snapshot.directory_mut(&entry.name);
                }
            }
            snapshot.recompute_totals();
        }
        self.refresh.record_refresh("", true);
        self.persist();
        Ok(())
    }

    /// Lists one directory of the projection, filtered: videos at or above
    /// the size floor become `.strm` entries, other files at or above the
    /// floor pass through, smaller files are hidden.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotFound`] for unknown directories.
    pub fn entries(&self, dir: &str) -> Result<Vec<ProjectedEntry>, ProjectionError> {
        let snapshot = self.snapshot.read();
        let directory = snapshot
            .directory(dir)
            .ok_or_else(|| ProjectionError::NotFound {
                path: dir.to_string(),
            })?;

        let mut out = Vec::new();
        for child in &snapshot.directories {
            if let Some(name) = direct_child(dir, &child.path) {
                out.push(ProjectedEntry::Directory {
                    name: name.to_string(),
                });
            }
        }
        for file in &directory.files {
            if file.size < self.config.min_projected_file_size {
                continue;
            }
            if self.config.is_video_name(&file.name) {
                if let Some(content) = redirect_content(self.backend, file) {
                    out.push(ProjectedEntry::Strm {
                        name: strm_name(&file.name),
                        content,
                    });
                }
            } else {
                out.push(ProjectedEntry::Passthrough {
                    name: file.name.clone(),
                    size: file.size,
                });
            }
        }
        Ok(out)
    }

    /// Content of a redirect file. Anything else is blocked: the
    /// projection never serves underlying bytes, which is what protects
    /// clients from accidentally pulling a multi-gigabyte download.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::DirectAccessBlocked`] for non-`.strm` paths,
    /// [`ProjectionError::NotFound`] for unknown entries.
    pub fn read(&self, path: &str) -> Result<String, ProjectionError> {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };

        let Some(stem) = name.strip_suffix(".strm") else {
            return Err(ProjectionError::DirectAccessBlocked {
                path: path.to_string(),
            });
        };

        let snapshot = self.snapshot.read();
        let directory = snapshot
            .directory(dir)
            .ok_or_else(|| ProjectionError::NotFound {
                path: path.to_string(),
            })?;
        directory
            .files
            .iter()
            .filter(|f| f.size >= self.config.min_projected_file_size)
            .filter(|f| self.config.is_video_name(&f.name))
            .find(|f| file_stem(&f.name) == stem)
            .and_then(|f| redirect_content(self.backend, f))
            .ok_or_else(|| ProjectionError::NotFound {
                path: path.to_string(),
            })
    }

    /// Access-driven sync of one directory: asks the refresh limiter, and
    /// on a go-ahead lists the directory, applies the delta, and persists.
    /// Returns whether a refresh actually ran.
    ///
    /// A completely empty remote listing is assumed to be an API failure
    /// and deletes nothing.
    ///
    /// # Errors
    ///
    /// Listing failures.
    #[instrument(skip(self, _cancel))]
    pub async fn sync_directory(
        &self,
        dir: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool, ProjectionError> {
        let decision = self.refresh.check(dir);
        if !decision.should_refresh() {
            debug!(dir, ?decision, "refresh declined");
            return Ok(false);
        }

        self.refresh.record_api_call();
        let entries = self.lister.list_directory(dir).await?;

        let changed = {
            let mut snapshot = self.snapshot.write();
            let directory = snapshot.directory_mut(dir);
            let files = listing_files(&entries);
            let mut delta = directory.delta_to(&files);

            if entries.is_empty() && !directory.files.is_empty() {
                warn!(
                    dir,
                    cached = directory.files.len(),
                    "empty listing; suppressing deletions"
                );
                delta.deleted.clear();
            }

            let changed = !delta.is_empty();
            directory.apply_delta(&delta);
            for entry in &entries {
                if entry.is_dir {
                    let child = join_path(dir, &entry.name);
                    snapshot.directory_mut(&child);
                }
            }
            snapshot.recompute_totals();
            changed
        };

        self.refresh.record_refresh(dir, changed);
        if changed {
            self.persist();
        }
        Ok(true)
    }

    /// Whether this mount owns the snapshot on disk.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.lock_path.is_some()
    }

    fn persist(&self) {
        if self.lock_path.is_none() {
            return;
        }
        let snapshot = self.snapshot.read();
        if let Err(e) = snapshot.save_atomic(&self.snapshot_path) {
            warn!(error = %e, "projection snapshot write failed");
        }
    }
}

impl Drop for ProjectionCache {
    fn drop(&mut self) {
        if let Some(lock) = &self.lock_path {
            let _ = std::fs::remove_file(lock);
        }
    }
}

/// Creates the lock file exclusively; `None` when another mount owns it.
fn acquire_lock(cache_dir: &Path) -> Option<PathBuf> {
    let path = cache_dir.join(LOCK_FILE);
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(mut file) => {
            use std::io::Write;
            let _ = write!(file, "{}", std::process::id());
            Some(path)
        }
        Err(_) => None,
    }
}

fn listing_files(entries: &[RemoteEntry]) -> Vec<FileEntry> {
    entries
        .iter()
        .filter(|e| !e.is_dir)
        .map(|e| FileEntry {
            name: e.name.clone(),
            size: e.size,
            mod_time: e.mod_time,
            file_id: e.handle.file_id.clone(),
            pick_code: e.handle.pick_code.clone(),
            hash: e.hash.clone(),
            mime_type: e.mime_type.clone(),
        })
        .collect()
}

fn apply_listing(directory: &mut super::snapshot::DirectorySnapshot, entries: &[RemoteEntry]) {
    let files = listing_files(entries);
    let delta = directory.delta_to(&files);
    directory.apply_delta(&delta);
}

fn redirect_content(backend: Backend, file: &FileEntry) -> Option<String> {
    let id = file.pick_code.as_deref().or(file.file_id.as_deref())?;
    Some(format!("{}://{}", backend.tag(), id))
}

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn strm_name(name: &str) -> String {
    format!("{}.strm", file_stem(name))
}

fn direct_child<'a>(parent: &str, candidate: &'a str) -> Option<&'a str> {
    if candidate.is_empty() {
        return None;
    }
    let rest = if parent.is_empty() {
        candidate
    } else {
        candidate.strip_prefix(parent)?.strip_prefix('/')?
    };
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::RemoteHandle;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct FakeLister {
        // dir path -> listing
        listings: Mutex<std::collections::HashMap<String, Vec<RemoteEntry>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeLister {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                listings: Mutex::new(std::collections::HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, dir: &str, entries: Vec<RemoteEntry>) {
            self.listings.lock().insert(dir.to_string(), entries);
        }
    }

    #[async_trait]
    impl DirectoryLister for FakeLister {
        async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>, ProjectionError> {
            self.calls.lock().push(path.to_string());
            Ok(self.listings.lock().get(path).cloned().unwrap_or_default())
        }
    }

    fn video(name: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            size,
            mod_time: Utc::now(),
            is_dir: false,
            handle: RemoteHandle {
                file_id: Some("9".to_string()),
                pick_code: Some(format!("pc_{name}")),
            },
            hash: None,
            mime_type: Some("video/x-matroska".to_string()),
        }
    }

    fn directory(name: &str) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            size: 0,
            mod_time: Utc::now(),
            is_dir: true,
            handle: RemoteHandle::default(),
            hash: None,
            mime_type: None,
        }
    }

    fn test_config(dir: &Path) -> Config {
        Config::default()
            .with_cache_dir(dir)
            .with_projection_filter(vec!["mkv".to_string(), "mp4".to_string()], 100)
    }

    async fn mount(dir: &Path, lister: Arc<FakeLister>) -> ProjectionCache {
        let config = test_config(dir);
        let refresh = Arc::new(RefreshLimiter::new(&config));
        ProjectionCache::mount(Backend::DriveA, "media", config, lister, refresh)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cold_start_lists_root_only() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set(
            "",
            vec![video("movie.mkv", 500), directory("shows"), video("tiny.mkv", 10)],
        );

        let cache = mount(dir.path(), Arc::clone(&lister)).await;
        assert_eq!(lister.calls.lock().as_slice(), &["".to_string()]);

        let entries = cache.entries("").unwrap();
        // shows/ and movie.strm; tiny.mkv is under the size floor.
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name() == "shows"));
        assert!(
            entries
                .iter()
                .any(|e| matches!(e, ProjectedEntry::Strm { name, content }
                    if name == "movie.strm" && content == "drivea://pc_movie.mkv"))
        );
    }

    #[tokio::test]
    async fn snapshot_survives_remount() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set("", vec![video("movie.mkv", 500)]);

        {
            let _cache = mount(dir.path(), Arc::clone(&lister)).await;
        }
        // Second mount finds the snapshot and does not relist the root.
        lister.calls.lock().clear();
        let cache = mount(dir.path(), Arc::clone(&lister)).await;
        assert!(lister.calls.lock().is_empty());
        assert_eq!(cache.entries("").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_filter_rebuilds_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set("", vec![video("movie.mkv", 500)]);
        {
            let _cache = mount(dir.path(), Arc::clone(&lister)).await;
        }

        // A different size floor produces a different fingerprint.
        let config = Config::default()
            .with_cache_dir(dir.path())
            .with_projection_filter(vec!["mkv".to_string()], 1);
        let refresh = Arc::new(RefreshLimiter::new(&config));
        lister.calls.lock().clear();
        let _cache = ProjectionCache::mount(
            Backend::DriveA,
            "media",
            config,
            Arc::clone(&lister) as Arc<dyn DirectoryLister>,
            refresh,
        )
        .await
        .unwrap();
        assert_eq!(lister.calls.lock().as_slice(), &["".to_string()]);
    }

    #[tokio::test]
    async fn direct_access_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set("", vec![video("movie.mkv", 500)]);
        let cache = mount(dir.path(), lister).await;

        assert_eq!(cache.read("movie.strm").unwrap(), "drivea://pc_movie.mkv");
        let err = cache.read("movie.mkv").unwrap_err();
        assert!(matches!(err, ProjectionError::DirectAccessBlocked { .. }));
    }

    #[tokio::test]
    async fn sync_applies_delta() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set("", vec![video("movie.mkv", 500), directory("shows")]);
        let cache = mount(dir.path(), Arc::clone(&lister)).await;

        lister.set("shows", vec![video("ep1.mkv", 200)]);
        let ran = cache
            .sync_directory("shows", &CancellationToken::new())
            .await
            .unwrap();
        assert!(ran);

        let entries = cache.entries("shows").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), "ep1.strm");
    }

    #[tokio::test]
    async fn empty_listing_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set("", vec![video("movie.mkv", 500)]);
        let cache = mount(dir.path(), Arc::clone(&lister)).await;

        // Remote now answers with nothing (a transient API failure shape).
        lister.set("", vec![]);
        // Allow an immediate re-refresh for the test.
        cache.refresh.reset();
        let ran = cache
            .sync_directory("", &CancellationToken::new())
            .await
            .unwrap();
        assert!(ran);
        // The file survived the empty listing.
        assert_eq!(cache.entries("").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_mount_degrades_without_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lister = FakeLister::new();
        lister.set("", vec![video("movie.mkv", 500)]);

        let first = mount(dir.path(), Arc::clone(&lister)).await;
        assert!(first.is_persistent());
        let second = mount(dir.path(), Arc::clone(&lister)).await;
        assert!(!second.is_persistent());
    }
}
