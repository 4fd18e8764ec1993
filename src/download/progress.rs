//! Per-chunk progress accounting for a running download.
//!
//! Workers record chunk completions; the engine's reporter task reads
//! snapshots and pushes short `[i/N chunks]` annotations to the enclosing
//! transfer's accounting sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One completed chunk.
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    bytes: u64,
    took: Duration,
}

/// Progress tracker shared between the chunk workers and the reporter.
#[derive(Debug)]
pub struct Progress {
    total_chunks: u32,
    total_bytes: u64,
    started: Instant,
    bytes_done: AtomicU64,
    chunks: DashMap<u32, ChunkRecord>,
}

/// Point-in-time view of a download's progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Percent of bytes finished, 0-100.
    pub percentage: f64,
    /// Mean throughput since the download started, bytes/sec.
    pub avg_speed: f64,
    /// Fastest single-chunk throughput seen, bytes/sec.
    pub peak_speed: f64,
    /// Estimated time remaining at the mean throughput.
    pub eta: Duration,
    /// Chunks finished.
    pub completed: u32,
    /// Chunks overall.
    pub total: u32,
    /// Bytes finished.
    pub bytes: u64,
    /// Bytes overall.
    pub total_bytes: u64,
}

impl Progress {
    /// Creates a tracker for `total_chunks` chunks spanning `total_bytes`.
    #[must_use]
    pub fn new(total_chunks: u32, total_bytes: u64) -> Self {
        Self {
            total_chunks,
            total_bytes,
            started: Instant::now(),
            bytes_done: AtomicU64::new(0),
            chunks: DashMap::new(),
        }
    }

    /// Records chunk `index` as complete. Idempotent: a repeated
    /// completion neither double-counts bytes nor shifts the timings.
    pub fn chunk_completed(&self, index: u32, bytes: u64, took: Duration) {
        let mut fresh = false;
        self.chunks.entry(index).or_insert_with(|| {
            fresh = true;
            ChunkRecord { bytes, took }
        });
        if fresh {
            self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Pre-marks a chunk restored from a previous run. Counts toward
    /// completion but not toward this session's speed measurements.
    pub fn chunk_restored(&self, index: u32, bytes: u64) {
        self.chunk_completed(index, bytes, Duration::ZERO);
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes = self.bytes_done.load(Ordering::Relaxed);
        let completed = self.chunks.len() as u32;
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let avg_speed = bytes as f64 / elapsed;

        let peak_speed = self
            .chunks
            .iter()
            .filter(|r| !r.took.is_zero())
            .map(|r| r.bytes as f64 / r.took.as_secs_f64().max(0.001))
            .fold(0.0f64, f64::max);

        let remaining = self.total_bytes.saturating_sub(bytes);
        let eta = if avg_speed > 0.0 {
            Duration::from_secs_f64(remaining as f64 / avg_speed)
        } else {
            Duration::ZERO
        };

        ProgressSnapshot {
            percentage: if self.total_bytes == 0 {
                100.0
            } else {
                bytes as f64 * 100.0 / self.total_bytes as f64
            },
            avg_speed,
            peak_speed,
            eta,
            completed,
            total: self.total_chunks,
            bytes,
            total_bytes: self.total_bytes,
        }
    }

    /// The `[i/N chunks]` annotation the reporter attaches to the
    /// transfer.
    #[must_use]
    pub fn annotation(&self) -> String {
        format!("[{}/{} chunks]", self.chunks.len(), self.total_chunks)
    }
}
