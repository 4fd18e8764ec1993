//! Configuration envelope for the transfer core.
//!
//! Every knob has a documented default; callers construct a [`Config`] with
//! `Config::default()` and override individual fields through the `with_*`
//! builders. The configuration is consumed by the stores, the downloader,
//! the upload state machine, and the projection cache.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 1 MiB in bytes.
pub const MIB: u64 = 1024 * 1024;

/// 1 GiB in bytes.
pub const GIB: u64 = 1024 * MIB;

/// Default on-disk cache size cap (100 MiB).
const DEFAULT_MAX_CACHE_SIZE: u64 = 100 * MIB;

/// Default target size after a cleanup pass (64 MiB).
const DEFAULT_TARGET_CACHE_SIZE: u64 = 64 * MIB;

/// Default minimum file size before chunked concurrent download kicks in (50 MiB).
const DEFAULT_MIN_CONCURRENT_SIZE: u64 = 50 * MIB;

/// Default multipart cutoff: files at or above this go through multipart upload (200 MiB).
const DEFAULT_UPLOAD_CUTOFF: u64 = 200 * MIB;

/// Files below this size skip hash-based instant upload entirely (1 MiB).
const DEFAULT_NO_HASH_SIZE: u64 = MIB;

/// Largest file accepted by the one-shot sample-stream upload path (100 MiB).
const DEFAULT_STREAM_UPLOAD_LIMIT: u64 = 100 * MIB;

/// Sources up to this size are tee-hashed in memory; larger ones spill to a temp file (32 MiB).
const DEFAULT_MAX_MEMORY_BUFFER: u64 = 32 * MIB;

/// Default TTL for persisted cache entries and resume records (24 hours).
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default item cap for the in-memory fallback map.
const DEFAULT_MEMORY_CACHE_CAP: usize = 10_000;

/// Default minimum size for a file to appear in the media projection (100 MiB).
const DEFAULT_MIN_PROJECTED_SIZE: u64 = 100 * MIB;

/// Video extensions projected as redirect files.
const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "ts", "m2ts", "iso",
];

/// Ordering used when the persistent cache evicts entries to get back under
/// its size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Oldest-created entries first (default).
    #[default]
    Size,
    /// Least-recently-accessed entries first.
    Lru,
    /// Lower-priority, less-recently-used entries first.
    PriorityLru,
    /// Oldest-created entries first (synonym of `Size`).
    Time,
    /// Unconditional full flush.
    Clear,
}

impl EvictionPolicy {
    /// Parses the configuration spelling (`size`, `lru`, `priority_lru`,
    /// `time`, `clear`). Unknown spellings fall back to the default.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Self::Lru,
            "priority_lru" | "priority-lru" => Self::PriorityLru,
            "time" => Self::Time,
            "clear" => Self::Clear,
            _ => Self::Size,
        }
    }
}

/// Tunables consumed across the transfer core.
///
/// All fields have working defaults; none are required.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all persisted state (stores, snapshots, temp files).
    pub cache_dir: PathBuf,
    /// On-disk cache size cap before eviction starts.
    pub max_cache_size: u64,
    /// Size the eviction passes aim for.
    pub target_cache_size: u64,
    /// Eviction candidate ordering.
    pub eviction_policy: EvictionPolicy,
    /// Item cap for the in-memory fallback map.
    pub memory_cache_cap: usize,
    /// TTL applied to cache entries and resume records.
    pub cache_ttl: Duration,
    /// Whether the directory-ID cache persists snapshots to disk.
    pub persistent_cache_enabled: bool,

    /// Minimum object size before the concurrent downloader participates.
    pub min_concurrent_size: u64,
    /// Fixed chunk size; `0` selects the size staircase.
    pub default_chunk_size: u64,

    /// Files at or above this size upload via multipart object storage.
    pub upload_cutoff: u64,
    /// Files below this size skip hash-based instant upload.
    pub no_hash_size: u64,
    /// Largest file accepted by the sample-stream path.
    pub stream_upload_limit: u64,
    /// In-memory tee-hash buffer threshold; larger sources spill to disk.
    pub max_memory_buffer: u64,

    /// Extensions projected as redirect files.
    pub video_extensions: Vec<String>,
    /// Minimum size for a file to be projected.
    pub min_projected_file_size: u64,

    /// Shortest interval between refreshes of the same directory.
    pub refresh_min_interval: Duration,
    /// Longest interval the refresh limiter will stretch to.
    pub refresh_max_interval: Duration,
    /// API QPS above which refreshes are suppressed.
    pub refresh_qps_threshold: f64,
    /// Change rate below which a directory is considered static.
    pub refresh_change_rate_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("drivebridge"),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            target_cache_size: DEFAULT_TARGET_CACHE_SIZE,
            eviction_policy: EvictionPolicy::default(),
            memory_cache_cap: DEFAULT_MEMORY_CACHE_CAP,
            cache_ttl: DEFAULT_CACHE_TTL,
            persistent_cache_enabled: true,
            min_concurrent_size: DEFAULT_MIN_CONCURRENT_SIZE,
            default_chunk_size: 0,
            upload_cutoff: DEFAULT_UPLOAD_CUTOFF,
            no_hash_size: DEFAULT_NO_HASH_SIZE,
            stream_upload_limit: DEFAULT_STREAM_UPLOAD_LIMIT,
            max_memory_buffer: DEFAULT_MAX_MEMORY_BUFFER,
            video_extensions: DEFAULT_VIDEO_EXTENSIONS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            min_projected_file_size: DEFAULT_MIN_PROJECTED_SIZE,
            refresh_min_interval: Duration::from_secs(30),
            refresh_max_interval: Duration::from_secs(600),
            refresh_qps_threshold: 5.0,
            refresh_change_rate_threshold: 0.1,
        }
    }
}

impl Config {
    /// Overrides the cache root directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Overrides the cache size cap and cleanup target.
    #[must_use]
    pub fn with_cache_sizes(mut self, max: u64, target: u64) -> Self {
        self.max_cache_size = max;
        self.target_cache_size = target.min(max);
        self
    }

    /// Overrides the eviction policy.
    #[must_use]
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Overrides the entry TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Overrides the concurrent-download participation threshold.
    #[must_use]
    pub fn with_min_concurrent_size(mut self, size: u64) -> Self {
        self.min_concurrent_size = size;
        self
    }

    /// Forces a fixed chunk size instead of the staircase.
    #[must_use]
    pub fn with_chunk_size(mut self, size: u64) -> Self {
        self.default_chunk_size = size;
        self
    }

    /// Overrides the multipart cutoff.
    #[must_use]
    pub fn with_upload_cutoff(mut self, cutoff: u64) -> Self {
        self.upload_cutoff = cutoff;
        self
    }

    /// Overrides the sample-stream size limit.
    #[must_use]
    pub fn with_stream_upload_limit(mut self, limit: u64) -> Self {
        self.stream_upload_limit = limit;
        self
    }

    /// Overrides the in-memory hash buffer threshold.
    #[must_use]
    pub fn with_max_memory_buffer(mut self, bytes: u64) -> Self {
        self.max_memory_buffer = bytes;
        self
    }

    /// Overrides the projection filters.
    #[must_use]
    pub fn with_projection_filter(mut self, extensions: Vec<String>, min_size: u64) -> Self {
        self.video_extensions = extensions;
        self.min_projected_file_size = min_size;
        self
    }

    /// Overrides the refresh-limiter interval band.
    #[must_use]
    pub fn with_refresh_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.refresh_min_interval = min;
        self.refresh_max_interval = max.max(min);
        self
    }

    /// Returns true when `name` carries one of the projected video extensions.
    #[must_use]
    pub fn is_video_name(&self, name: &str) -> bool {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.video_extensions.iter().any(|e| *e == ext)
    }
}
