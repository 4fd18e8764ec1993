//! Read-only media projection.
//!
//! Presents a remote subtree as a tree of tiny `.strm` redirect files whose
//! content names the backing object (`<backend>://<opaque_id>`). The
//! snapshot of the subtree persists across mounts; directory listings are
//! refreshed lazily through the refresh limiter, never proactively walked.

pub mod cache;
pub mod snapshot;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use cache::{ProjectedEntry, ProjectionCache};
pub use snapshot::{DirectorySnapshot, FileEntry, ListingDelta, ProjectionSnapshot};

use crate::backend::RemoteHandle;

/// Errors from the projection layer.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Snapshot file trouble.
    #[error("projection io error at {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot decode failure.
    #[error("projection snapshot corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The backend listing failed.
    #[error("listing {path} failed: {message}")]
    Listing {
        /// Directory that failed to list.
        path: String,
        /// Backend-reported message.
        message: String,
    },

    /// Direct access to a projected file's bytes was attempted.
    #[error("direct access blocked for {path}; read the redirect file instead")]
    DirectAccessBlocked {
        /// The file whose bytes were requested.
        path: String,
    },

    /// No such entry in the projection.
    #[error("not found in projection: {path}")]
    NotFound {
        /// The missing path.
        path: String,
    },
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Leaf name.
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Remote modification time.
    pub mod_time: DateTime<Utc>,
    /// Whether this is a subdirectory.
    pub is_dir: bool,
    /// Server handles (files only).
    pub handle: RemoteHandle,
    /// Content hash when the listing carries one.
    pub hash: Option<String>,
    /// MIME type when the listing carries one.
    pub mime_type: Option<String>,
}

/// The backend capability the projection consumes: list one directory,
/// no recursion.
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    /// Lists `path` (relative to the projection root, `""` = root).
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>, ProjectionError>;
}
