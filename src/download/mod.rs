//! Chunked concurrent downloads with persistent resume.
//!
//! The [`engine::ConcurrentDownloader`] splits large objects into byte-range
//! chunks, fetches them through a per-backend [`adapter::DownloadAdapter`],
//! and records completion in the resume store so an interrupted transfer
//! picks up where it stopped.

pub mod adapter;
pub mod engine;
pub mod progress;
pub mod task;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use adapter::{AdapterLimits, DownloadAdapter, HttpChunkFetcher};
pub use engine::ConcurrentDownloader;
pub use progress::{Progress, ProgressSnapshot};
pub use task::{ByteRange, DownloadOptions};

use crate::retry::{ErrorCategory, classify};

/// Errors from chunk fetching and download orchestration.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// HTTP error response from the drive or its CDN.
    #[error("HTTP {status} downloading {url}: {message}")]
    Http {
        /// The URL that failed.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body or status text (truncated).
        message: String,
        /// Retry-After header value, when the server sent one.
        retry_after: Option<String>,
    },

    /// Network-level failure (DNS, connect, TLS, mid-body reset).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The signed URL was rejected; a fresh one must be fetched.
    #[error("signed URL expired: {url}")]
    UrlExpired {
        /// The rejected URL.
        url: String,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        /// What timed out.
        operation: String,
        /// The deadline that was exceeded.
        limit: Duration,
    },

    /// Local filesystem failure.
    #[error("io error at {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The finished temp file does not match the object size.
    #[error(
        "size mismatch at {path}: expected {expected} bytes, got {actual} \
         ({completed_chunks} chunks were marked complete)"
    )]
    SizeMismatch {
        /// The temp file that failed the check.
        path: PathBuf,
        /// Expected byte count.
        expected: u64,
        /// Observed byte count.
        actual: u64,
        /// Chunks the task had marked complete.
        completed_chunks: u32,
    },

    /// Final integrity verification failed.
    #[error("verification failed for {path}: {reason}")]
    Verification {
        /// The downloaded file.
        path: PathBuf,
        /// Why verification failed.
        reason: String,
    },

    /// One or more chunk workers failed; carries the first failure.
    #[error("{count} chunk(s) failed, first: {first}")]
    ChunkFailures {
        /// The first error observed.
        #[source]
        first: Box<DownloadError>,
        /// Total failed chunks.
        count: usize,
    },

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Builds an HTTP error, folding URL-expiry responses into
    /// [`DownloadError::UrlExpired`] so callers can match on it directly.
    #[must_use]
    pub fn from_response(
        url: &str,
        status: u16,
        message: &str,
        retry_after: Option<String>,
    ) -> Self {
        if classify(Some(status), message) == ErrorCategory::UrlExpired {
            return Self::UrlExpired {
                url: url.to_string(),
            };
        }
        Self::Http {
            url: url.to_string(),
            status,
            message: truncate(message, 200),
            retry_after,
        }
    }

    /// Classifies this error for retry decisions.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UrlExpired { .. } => ErrorCategory::UrlExpired,
            Self::Http {
                status, message, ..
            } => classify(Some(*status), message),
            Self::Network { source, .. } => {
                if source.is_timeout() || source.is_connect() {
                    ErrorCategory::NetworkTimeout
                } else {
                    classify(None, &source.to_string())
                }
            }
            Self::Timeout { .. } => ErrorCategory::NetworkTimeout,
            Self::ChunkFailures { first, .. } => first.category(),
            Self::Io { .. }
            | Self::SizeMismatch { .. }
            | Self::Verification { .. }
            | Self::Cancelled => ErrorCategory::Fatal,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
