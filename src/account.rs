//! Accounting hooks for the framework's transfer bookkeeping.
//!
//! The downloader and uploader report incremental byte counts, short status
//! annotations, and server-side copy attribution through this sink. The
//! framework supplies the real implementation; [`NullSink`] is used when the
//! caller does not care.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Receives transfer progress from the downloader and uploader.
///
/// Implementations must be cheap: `add_bytes` is called once per streamed
/// buffer on the hot path.
pub trait AccountingSink: Send + Sync {
    /// Incremental byte count for the current transfer.
    fn add_bytes(&self, n: u64);

    /// Attaches a short textual note to the transfer (for example
    /// `[3/5 chunks]`). Replaces the previous note.
    fn set_annotation(&self, _note: &str) {}

    /// The transfer turned out to be a server-side operation; no bytes will
    /// traverse the client.
    fn server_side_transfer_start(&self) {}

    /// A server-side copy finished; `bytes` is the logical size moved.
    fn server_side_copy_end(&self, _bytes: u64) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AccountingSink for NullSink {
    fn add_bytes(&self, _n: u64) {}
}

/// In-memory sink that records what it saw. Used by tests and by the
/// cross-cloud coordinator's byte tracking.
#[derive(Debug, Default)]
pub struct RecordingSink {
    bytes: AtomicU64,
    server_side_bytes: AtomicU64,
    annotation: Mutex<Option<String>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes reported so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Bytes attributed to server-side copies.
    #[must_use]
    pub fn server_side_bytes(&self) -> u64 {
        self.server_side_bytes.load(Ordering::Relaxed)
    }

    /// Last annotation set, if any.
    #[must_use]
    pub fn annotation(&self) -> Option<String> {
        self.annotation.lock().clone()
    }
}

impl AccountingSink for RecordingSink {
    fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn set_annotation(&self, note: &str) {
        *self.annotation.lock() = Some(note.to_string());
    }

    fn server_side_copy_end(&self, bytes: u64) {
        self.server_side_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}
