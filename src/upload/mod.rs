//! Upload state machine: instant upload, multipart object storage, and the
//! sample-stream path.
//!
//! The machine picks exactly one path per upload. Hash-based instant upload
//! is tried first whenever the mode and size allow it: presenting the
//! content's SHA-1 can substitute for moving any bytes at all. Misses fall
//! back to multipart object-storage upload, a single-part put, or the
//! one-shot sample-stream form post, depending on size and mode.
//!
//! The drive API, the credentials endpoint, and the object-storage SDK are
//! consumed as capability traits so the machine stays testable and
//! backend-neutral.

pub mod callback;
pub mod hash;
pub mod machine;
pub mod multipart;
pub mod sample;
pub mod source;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

pub use callback::parse_callback;
pub use machine::{UploadMode, UploadOptions, UploadStateMachine};
pub use source::{BufferedSource, SourceFactory};

use crate::retry::{ErrorCategory, classify};

/// Errors from the upload paths.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The drive API rejected a call.
    #[error("upload api error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Api {
        /// HTTP status, when one applies.
        status: Option<u16>,
        /// Server-reported message.
        message: String,
    },

    /// The server answered outside the protocol (unknown status code,
    /// missing fields).
    #[error("upload protocol error: {message}")]
    Protocol {
        /// What was wrong.
        message: String,
    },

    /// The credentials endpoint returned unusable credentials.
    #[error("object-storage credentials invalid: {message}")]
    Credentials {
        /// What was missing.
        message: String,
    },

    /// Transport failure.
    #[error("upload network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Local disk trouble (buffer spill, source reads).
    #[error("upload io error{}: {source}", path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    Io {
        /// Affected path, when known.
        path: Option<PathBuf>,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The source cannot be re-read and a retry or ranged read needs it.
    #[error("source cannot be reopened: {reason}")]
    SourceNotReopenable {
        /// Why the reopen failed.
        reason: String,
    },

    /// Mode/size combination that can never succeed.
    #[error("upload not possible: {reason}")]
    NotPossible {
        /// Why no path applies.
        reason: String,
    },

    /// The caller cancelled the upload.
    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Builds an IO error without a path.
    #[must_use]
    pub fn io(source: std::io::Error) -> Self {
        Self::Io { path: None, source }
    }

    /// Classifies this error for retry decisions.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Api { status, message } => classify(*status, message),
            Self::Network(source) => {
                if source.is_timeout() || source.is_connect() {
                    ErrorCategory::NetworkTimeout
                } else {
                    classify(None, &source.to_string())
                }
            }
            Self::Protocol { .. }
            | Self::Credentials { .. }
            | Self::Io { .. }
            | Self::SourceNotReopenable { .. }
            | Self::NotPossible { .. }
            | Self::Cancelled => ErrorCategory::Fatal,
        }
    }
}

/// The canonical record every successful upload resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    /// Server-issued file id.
    pub file_id: String,
    /// Server-issued short pick code.
    pub pick_code: String,
    /// Object size in bytes.
    pub size: u64,
    /// SHA-1 digest, when the flow computed or received one.
    pub sha1: Option<String>,
}

/// Request for the hash-upload init endpoint.
#[derive(Debug, Clone, Default)]
pub struct InitUploadRequest {
    /// Leaf name of the file being uploaded.
    pub file_name: String,
    /// Size in bytes.
    pub file_size: u64,
    /// Upload target, `U_1_<dir_id>`.
    pub target: String,
    /// Upper-case SHA-1 of the whole content; absent when the caller is
    /// skipping dedup (unknown size).
    pub file_id: Option<String>,
    /// Upper-case SHA-1 of the first 128 KiB, when available.
    pub preid: Option<String>,
    /// Resume pick code from an earlier attempt.
    pub pick_code: Option<String>,
    /// Echoed sign key from a status-7 challenge.
    pub sign_key: Option<String>,
    /// Upper-case SHA-1 of the challenged byte range.
    pub sign_val: Option<String>,
}

impl InitUploadRequest {
    /// Builds the standard target string for a directory id.
    #[must_use]
    pub fn target_for(dir_id: &str) -> String {
        format!("U_1_{dir_id}")
    }
}

/// Response from the hash-upload init endpoint.
#[derive(Debug, Clone, Default)]
pub struct InitUploadResponse {
    /// 1 = bytes required, 2 = dedup hit, 7 = sign challenge.
    pub status: i64,
    /// Object-storage bucket for the byte upload.
    pub bucket: Option<String>,
    /// Object-storage key for the byte upload.
    pub object: Option<String>,
    /// Callback blob to attach to the storage upload.
    pub callback: Option<String>,
    /// Callback variables companion blob.
    pub callback_var: Option<String>,
    /// File id (dedup hit).
    pub file_id: Option<String>,
    /// Pick code (dedup hit or resume token).
    pub pick_code: Option<String>,
    /// Challenge key (status 7).
    pub sign_key: Option<String>,
    /// Challenged byte range `start-end` (status 7).
    pub sign_check: Option<String>,
}

/// Short-lived object-storage credentials.
#[derive(Debug, Clone)]
pub struct ObjectStoreCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
    /// Session token.
    pub security_token: String,
    /// When these credentials stop working.
    pub expiration: DateTime<Utc>,
}

impl ObjectStoreCredentials {
    /// Rejects credentials with empty fields, which some endpoints return
    /// instead of an error status.
    ///
    /// # Errors
    ///
    /// [`UploadError::Credentials`] naming the empty field.
    pub fn validate(&self) -> Result<(), UploadError> {
        for (field, value) in [
            ("AccessKeyID", &self.access_key_id),
            ("AccessKeySecret", &self.access_key_secret),
            ("SecurityToken", &self.security_token),
        ] {
            if value.is_empty() {
                return Err(UploadError::Credentials {
                    message: format!("empty {field}"),
                });
            }
        }
        Ok(())
    }

    /// Whether the credentials expire within `margin`.
    #[must_use]
    pub fn expires_within(&self, margin: chrono::Duration) -> bool {
        Utc::now() + margin >= self.expiration
    }
}

/// Policy grant for the sample-stream form post.
#[derive(Debug, Clone)]
pub struct SamplePolicy {
    /// Upload host to POST to.
    pub host: String,
    /// Object key form field.
    pub object_key: String,
    /// Signed policy blob.
    pub policy: String,
    /// Access key id form field.
    pub access_key_id: String,
    /// Callback blob form field.
    pub callback: String,
    /// Request signature form field.
    pub signature: String,
}

/// The drive's upload API.
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// Hash-upload init call; also grants byte-upload coordinates.
    async fn init_upload(&self, req: &InitUploadRequest)
    -> Result<InitUploadResponse, UploadError>;

    /// Policy grant for a sample-stream upload.
    async fn sample_policy(
        &self,
        file_name: &str,
        dir_id: &str,
    ) -> Result<SamplePolicy, UploadError>;
}

/// The credentials endpoint.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Fetches fresh short-lived credentials.
    async fn fetch(&self) -> Result<ObjectStoreCredentials, UploadError>;
}

/// Lazily refreshing wrapper over a [`CredentialsProvider`].
///
/// Credentials are fetched on first use and refreshed preemptively when
/// they approach expiry, so a long multipart upload never presents a dead
/// token mid-flight.
pub struct CachedCredentials {
    provider: std::sync::Arc<dyn CredentialsProvider>,
    cached: tokio::sync::Mutex<Option<ObjectStoreCredentials>>,
}

impl std::fmt::Debug for CachedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCredentials").finish_non_exhaustive()
    }
}

impl CachedCredentials {
    /// Refresh margin before expiry.
    const REFRESH_MARGIN_SECS: i64 = 300;

    /// Wraps a provider.
    #[must_use]
    pub fn new(provider: std::sync::Arc<dyn CredentialsProvider>) -> Self {
        Self {
            provider,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Current credentials, refreshed when stale.
    ///
    /// # Errors
    ///
    /// Fetch failures and [`UploadError::Credentials`] for unusable
    /// responses.
    pub async fn get(&self) -> Result<ObjectStoreCredentials, UploadError> {
        let mut cached = self.cached.lock().await;
        let stale = match cached.as_ref() {
            Some(creds) => creds.expires_within(chrono::Duration::seconds(Self::REFRESH_MARGIN_SECS)),
            None => true,
        };
        if stale {
            debug!("refreshing object-storage credentials");
            let fresh = self.provider.fetch().await?;
            fresh.validate()?;
            *cached = Some(fresh);
        }
        Ok(cached.clone().unwrap_or_else(|| unreachable!()))
    }
}

/// The slice of the object-storage SDK the machine consumes. The real SDK
/// handles TCP-level parallelism; part upload here is sequential by
/// contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Starts a multipart upload and returns its id.
    async fn initiate_multipart(
        &self,
        creds: &ObjectStoreCredentials,
        bucket: &str,
        key: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, UploadError>;

    /// Uploads one part; returns its etag.
    async fn upload_part(
        &self,
        creds: &ObjectStoreCredentials,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, UploadError>;

    /// Completes the multipart upload; returns the server callback JSON.
    async fn complete_multipart(
        &self,
        creds: &ObjectStoreCredentials,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
        callback: Option<&str>,
        callback_var: Option<&str>,
    ) -> Result<serde_json::Value, UploadError>;

    /// Aborts a multipart upload (server-side cleanup).
    async fn abort_multipart(
        &self,
        creds: &ObjectStoreCredentials,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), UploadError>;

    /// Single-request object put; returns the server callback JSON.
    async fn put_object(
        &self,
        creds: &ObjectStoreCredentials,
        bucket: &str,
        key: &str,
        body: Bytes,
        headers: &HashMap<String, String>,
        callback: Option<&str>,
        callback_var: Option<&str>,
    ) -> Result<serde_json::Value, UploadError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn credential_validation() {
        let good = ObjectStoreCredentials {
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            security_token: "token".into(),
            expiration: Utc::now() + chrono::Duration::hours(1),
        };
        assert!(good.validate().is_ok());

        let bad = ObjectStoreCredentials {
            access_key_secret: String::new(),
            ..good.clone()
        };
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("AccessKeySecret"));
    }

    #[test]
    fn expiry_margin() {
        let creds = ObjectStoreCredentials {
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            security_token: "token".into(),
            expiration: Utc::now() + chrono::Duration::seconds(60),
        };
        assert!(creds.expires_within(chrono::Duration::seconds(300)));
        assert!(!creds.expires_within(chrono::Duration::seconds(10)));
    }

    #[test]
    fn init_target_format() {
        assert_eq!(InitUploadRequest::target_for("42"), "U_1_42");
    }

    #[test]
    fn api_error_categories() {
        let rate_limited = UploadError::Api {
            status: Some(429),
            message: String::new(),
        };
        assert_eq!(rate_limited.category(), ErrorCategory::RateLimit);

        let fatal = UploadError::NotPossible {
            reason: "x".into(),
        };
        assert_eq!(fatal.category(), ErrorCategory::Fatal);
    }
}
