//! Cross-cloud transfer coordination.
//!
//! When the same source object feeds several destination transfers, the
//! coordinator makes sure it is downloaded once: finished temp files are
//! registered under a source-identity key and handed out by refcount.
//! Transfer records progress through a strictly monotonic status machine
//! and are dropped once terminal.

pub mod coordinator;
pub mod temp;

use std::path::PathBuf;

use thiserror::Error;

pub use coordinator::{CoordinatorStats, CrossCloudCoordinator, CrossCloudTransfer};
pub use temp::{TempFileHandle, TempFileRegistry};

/// Status of a cross-cloud transfer. Transitions are monotonic: a status
/// never moves backwards, and the three terminal states accept no further
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransferStatus {
    /// Created, nothing started.
    Pending,
    /// Pulling from the source drive.
    Downloading,
    /// Source bytes are on local disk.
    DownloadComplete,
    /// Pushing to the destination drive.
    Uploading,
    /// Destination has all bytes.
    UploadComplete,
    /// Done; record is about to be dropped.
    Completed,
    /// Gave up; record is about to be dropped.
    Failed,
    /// Caller cancelled; record is about to be dropped.
    Cancelled,
}

impl TransferStatus {
    /// Position in the forward progression. Terminal sinks share the top
    /// rank so no transition can leave them.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::DownloadComplete => 2,
            Self::Uploading => 3,
            Self::UploadComplete => 4,
            Self::Completed | Self::Failed | Self::Cancelled => 5,
        }
    }

    /// Whether no further transitions are permitted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Errors from the coordinator.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No live transfer under that id.
    #[error("unknown transfer: {id}")]
    UnknownTransfer {
        /// The id that did not resolve.
        id: String,
    },

    /// A transition would move the status backwards or out of a terminal
    /// state.
    #[error("invalid transition {from:?} -> {to:?} for transfer {id}")]
    InvalidTransition {
        /// The transfer involved.
        id: String,
        /// Current status.
        from: TransferStatus,
        /// Requested status.
        to: TransferStatus,
    },

    /// The streamed source ended at the wrong size.
    #[error("temp file {path} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// The temp file written.
        path: PathBuf,
        /// Expected byte count.
        expected: u64,
        /// Observed byte count.
        actual: u64,
    },

    /// Filesystem trouble with a temp file.
    #[error("temp file io error at {path}: {source}")]
    Io {
        /// Affected path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
