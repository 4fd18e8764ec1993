//! Persistent snapshot of the projected subtree.
//!
//! JSON on disk, written atomically via `path.tmp` + rename so a crash can
//! never leave a half-written snapshot. The version tag, backend, remote
//! root, and config fingerprint must all match the current mount or the
//! snapshot is rebuilt from scratch. Durations are serialized as strings
//! (`"1m30s"`) to survive schema moves.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::ProjectionError;
use crate::backend::Backend;
use crate::config::Config;

/// Schema version this code reads and writes.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// One projected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Leaf name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Remote modification time.
    pub mod_time: DateTime<Utc>,
    /// Server file id.
    pub file_id: Option<String>,
    /// Server pick code.
    pub pick_code: Option<String>,
    /// Content hash when known.
    pub hash: Option<String>,
    /// MIME type when known.
    pub mime_type: Option<String>,
}

/// One directory of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// Path relative to the projection root (`""` = root).
    pub path: String,
    /// Backend directory id, when resolved.
    pub dir_id: Option<String>,
    /// Directory modification time as last listed.
    pub mod_time: DateTime<Utc>,
    /// Files in this directory.
    pub file_count: u64,
    /// Total file bytes in this directory.
    pub total_size: u64,
    /// The files themselves.
    pub files: Vec<FileEntry>,
}

/// Delta between a cached directory and a fresh listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingDelta {
    /// Files present remotely but not cached.
    pub added: Vec<FileEntry>,
    /// Files whose size or mod time changed.
    pub modified: Vec<FileEntry>,
    /// Names cached but gone remotely.
    pub deleted: Vec<String>,
}

impl ListingDelta {
    /// Whether the delta changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

impl DirectorySnapshot {
    /// Creates an empty directory entry.
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            dir_id: None,
            mod_time: Utc::now(),
            file_count: 0,
            total_size: 0,
            files: Vec::new(),
        }
    }

    /// Computes the delta from this directory's cached files to a fresh
    /// listing.
    #[must_use]
    pub fn delta_to(&self, current: &[FileEntry]) -> ListingDelta {
        let cached: HashMap<&str, &FileEntry> =
            self.files.iter().map(|f| (f.name.as_str(), f)).collect();
        let fresh: HashMap<&str, &FileEntry> =
            current.iter().map(|f| (f.name.as_str(), f)).collect();

        let mut delta = ListingDelta::default();
        for file in current {
            match cached.get(file.name.as_str()) {
                None => delta.added.push(file.clone()),
                Some(old) if old.size != file.size || old.mod_time != file.mod_time => {
                    delta.modified.push(file.clone());
                }
                Some(_) => {}
            }
        }
        for file in &self.files {
            if !fresh.contains_key(file.name.as_str()) {
                delta.deleted.push(file.name.clone());
            }
        }
        delta
    }

    /// Applies a delta to the cached file list: start from the existing
    /// files, append additions, modify in place, delete by name. The list
    /// is never rebuilt from the additions alone.
    pub fn apply_delta(&mut self, delta: &ListingDelta) {
        for added in &delta.added {
            if !self.files.iter().any(|f| f.name == added.name) {
                self.files.push(added.clone());
            }
        }
        for modified in &delta.modified {
            if let Some(slot) = self.files.iter_mut().find(|f| f.name == modified.name) {
                *slot = modified.clone();
            }
        }
        self.files.retain(|f| !delta.deleted.contains(&f.name));

        self.file_count = self.files.len() as u64;
        self.total_size = self.files.iter().map(|f| f.size).sum();
        self.mod_time = Utc::now();
    }
}

/// The persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
    /// Schema version tag.
    pub version: String,
    /// Backend the snapshot was built against.
    pub backend: Backend,
    /// Remote root of the projection.
    pub remote_path: String,
    /// Fingerprint of the filter configuration.
    pub config_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
    /// Nominal expiry (informational; staleness is access-driven).
    pub expires_at: DateTime<Utc>,
    /// Snapshot TTL used to compute `expires_at`.
    #[serde(with = "duration_string")]
    pub ttl: Duration,
    /// Files across all directories.
    pub file_count: u64,
    /// Bytes across all directories.
    pub total_size: u64,
    /// The directories, root first.
    pub directories: Vec<DirectorySnapshot>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProjectionSnapshot {
    /// Creates an empty snapshot for a mount.
    #[must_use]
    pub fn new(backend: Backend, remote_path: &str, config_hash: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            backend,
            remote_path: remote_path.to_string(),
            config_hash: config_hash.to_string(),
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            ttl,
            file_count: 0,
            total_size: 0,
            directories: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Whether this snapshot belongs to the given mount.
    #[must_use]
    pub fn matches(&self, backend: Backend, remote_path: &str, config_hash: &str) -> bool {
        self.version == SNAPSHOT_VERSION
            && self.backend == backend
            && self.remote_path == remote_path
            && self.config_hash == config_hash
    }

    /// The directory entry for `path`, when present.
    #[must_use]
    pub fn directory(&self, path: &str) -> Option<&DirectorySnapshot> {
        self.directories.iter().find(|d| d.path == path)
    }

    /// Mutable access, creating the directory entry on first touch.
    pub fn directory_mut(&mut self, path: &str) -> &mut DirectorySnapshot {
        if let Some(i) = self.directories.iter().position(|d| d.path == path) {
            &mut self.directories[i]
        } else {
            self.directories.push(DirectorySnapshot::new(path));
            let last = self.directories.len() - 1;
            &mut self.directories[last]
        }
    }

    /// Recomputes the aggregate counters from the directories.
    pub fn recompute_totals(&mut self) {
        self.file_count = self.directories.iter().map(|d| d.file_count).sum();
        self.total_size = self.directories.iter().map(|d| d.total_size).sum();
        self.updated_at = Utc::now();
    }

    /// Loads a snapshot from disk.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Io`] / [`ProjectionError::Corrupt`].
    pub fn load(path: &Path) -> Result<Self, ProjectionError> {
        let raw = std::fs::read(path).map_err(|e| ProjectionError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let snapshot: Self = serde_json::from_slice(&raw)?;
        debug!(
            path = %path.display(),
            files = snapshot.file_count,
            "loaded projection snapshot"
        );
        Ok(snapshot)
    }

    /// Writes the snapshot atomically: `path.tmp`, then rename.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Io`] / [`ProjectionError::Corrupt`].
    pub fn save_atomic(&self, path: &Path) -> Result<(), ProjectionError> {
        let tmp = path.with_extension("tmp");
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, &raw).map_err(|e| ProjectionError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| ProjectionError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!(path = %path.display(), files = self.file_count, "projection snapshot saved");
        Ok(())
    }
}

/// Fingerprint of the configuration fields that shape the projection.
/// A changed filter invalidates the snapshot.
#[must_use]
pub fn config_fingerprint(config: &Config) -> String {
    let mut hasher = Sha256::new();
    for ext in &config.video_extensions {
        hasher.update(ext.as_bytes());
        hasher.update(b",");
    }
    hasher.update(config.min_projected_file_size.to_le_bytes());
    hex::encode(&hasher.finalize()[..4])
}

/// `Duration` ⟷ `"1m30s"` string codec.
mod duration_string {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        format_duration(*d).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub(super) fn format_duration(d: Duration) -> String {
        let total = d.as_secs();
        let (hours, rem) = (total / 3600, total % 3600);
        let (minutes, seconds) = (rem / 60, rem % 60);
        let mut out = String::new();
        if hours > 0 {
            out.push_str(&format!("{hours}h"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}m"));
        }
        if seconds > 0 || out.is_empty() {
            out.push_str(&format!("{seconds}s"));
        }
        out
    }

    pub(super) fn parse_duration(raw: &str) -> Result<Duration, String> {
        let mut total = 0u64;
        let mut digits = String::new();
        for c in raw.trim().chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("bad duration: {raw:?}"))?;
            digits.clear();
            total += match c {
                'h' => value * 3600,
                'm' => value * 60,
                's' => value,
                _ => return Err(format!("bad duration unit {c:?} in {raw:?}")),
            };
        }
        if !digits.is_empty() {
            return Err(format!("trailing digits in duration {raw:?}"));
        }
        Ok(Duration::from_secs(total))
    }
}
