//! Backend identities and per-backend presets.
//!
//! The two supported drives differ in their per-object handle format, their
//! API rate budget, and how many transfers they tolerate in parallel. Those
//! differences live here; everything else in the crate consumes the uniform
//! [`RemoteObject`] / [`RemoteHandle`] surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported cloud-drive backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Drive-A: objects carry both a file id and a short pick code.
    DriveA,
    /// Drive-B: objects carry a file id only.
    DriveB,
}

impl Backend {
    /// Stable tag used in cache-key namespaces and task identities.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::DriveA => "drivea",
            Self::DriveB => "driveb",
        }
    }

    /// API rate budget: sustained queries per second.
    #[must_use]
    pub fn api_qps(self) -> f64 {
        match self {
            Self::DriveA => 8.0,
            Self::DriveB => 15.0,
        }
    }

    /// API rate budget: burst capacity.
    #[must_use]
    pub fn api_burst(self) -> u32 {
        match self {
            Self::DriveA => 12,
            Self::DriveB => 20,
        }
    }

    /// Ceiling on simultaneous transfers against this backend.
    #[must_use]
    pub fn max_transfers(self) -> usize {
        match self {
            Self::DriveA => 2,
            Self::DriveB => 3,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Rate budget for a backend that is not one of the two supported drives.
/// Used when a limiter is built without a backend preset.
pub const UNKNOWN_BACKEND_QPS: f64 = 5.0;

/// Burst capacity companion to [`UNKNOWN_BACKEND_QPS`].
pub const UNKNOWN_BACKEND_BURST: u32 = 8;

/// Server-issued handles identifying a stored object.
///
/// Drive-A issues both forms; Drive-B only the file id. Either may be used
/// in the redirect-file projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    /// Numeric-ish opaque file id.
    pub file_id: Option<String>,
    /// Short pick code (Drive-A only).
    pub pick_code: Option<String>,
}

impl RemoteHandle {
    /// Preferred opaque id for redirect content: pick code when present,
    /// else file id.
    #[must_use]
    pub fn opaque_id(&self) -> Option<&str> {
        self.pick_code.as_deref().or(self.file_id.as_deref())
    }
}

/// The slice of the framework's object model this crate consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Which drive the object lives on.
    pub backend: Backend,
    /// Remote path, `/`-separated, no leading slash.
    pub remote_path: String,
    /// Leaf name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Remote modification time.
    pub mod_time: DateTime<Utc>,
    /// Server-issued handles.
    pub handle: RemoteHandle,
    /// SHA-1 content digest when the server exposes one (lowercase hex).
    pub sha1: Option<String>,
}

impl RemoteObject {
    /// Redirect-file content for this object: `<backend>://<opaque_id>`.
    ///
    /// Returns `None` when the object carries no usable handle.
    #[must_use]
    pub fn redirect_content(&self) -> Option<String> {
        let id = self.handle.opaque_id()?;
        Some(format!("{}://{}", self.backend.tag(), id))
    }
}
