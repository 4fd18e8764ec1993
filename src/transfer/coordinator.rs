//! The cross-cloud transfer coordinator.
//!
//! Owns the live transfer records, the temp-file registry, and the
//! coordinator-wide statistics. Status transitions for one transfer are
//! serialized under the coordinator's lock; transfers do not contend with
//! each other beyond that map access.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::temp::{TempFileHandle, TempFileRegistry, source_key};
use super::{TransferError, TransferStatus};
use crate::backend::Backend;

/// Interval between temp-file cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Error-history entries kept per transfer.
const ERROR_HISTORY_CAP: usize = 10;

/// One cross-cloud transfer record.
#[derive(Debug, Clone)]
pub struct CrossCloudTransfer {
    /// Identity key (also the map key).
    pub transfer_id: String,
    /// Source drive.
    pub source: Backend,
    /// Destination drive.
    pub dest: Backend,
    /// Destination path.
    pub dest_path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Current status.
    pub status: TransferStatus,
    /// Bytes pulled from the source so far.
    pub downloaded_bytes: u64,
    /// Bytes pushed to the destination so far.
    pub uploaded_bytes: u64,
    /// Local temp file, once the download lands.
    pub temp_path: Option<PathBuf>,
    /// Content digest, once computed.
    pub content_digest: Option<String>,
    /// When the transfer started.
    pub started_at: DateTime<Utc>,
    /// Last mutation.
    pub last_update: DateTime<Utc>,
    /// Retries attempted.
    pub retry_count: u32,
    /// Most recent errors, oldest first.
    pub error_history: Vec<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
}

/// Aggregate coordinator counters.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    /// Transfers started (including reused ones).
    pub started: u64,
    /// Transfers completed successfully.
    pub completed: u64,
    /// Transfers that ended in failure.
    pub failed: u64,
    /// Bytes moved by completed transfers.
    pub total_bytes: u64,
    /// Times an in-flight or finished download was reused instead of
    /// re-downloading.
    pub duplicate_downloads_avoided: u64,
}

/// De-duplicates downloads shared between transfers and tracks status.
pub struct CrossCloudCoordinator {
    transfers: Mutex<HashMap<String, CrossCloudTransfer>>,
    registry: TempFileRegistry,
    temp_dir: PathBuf,
    stats: RwLock<CoordinatorStats>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CrossCloudCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossCloudCoordinator")
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

/// Identity key for a transfer: destination-side, with slashes escaped so
/// the key is unambiguous.
#[must_use]
pub fn transfer_key(source: Backend, dest: Backend, dest_path: &str, size: u64) -> String {
    format!(
        "{}|{}|{}|{}",
        source.tag(),
        dest.tag(),
        urlencoding::encode(dest_path),
        size
    )
}

impl CrossCloudCoordinator {
    /// Creates a coordinator owning `temp_dir` and starts the periodic
    /// temp-file cleanup. Must be called from a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TransferError::Io`] when the temp directory cannot be created.
    pub fn new(temp_dir: &Path, temp_max_age: Duration) -> Result<Arc<Self>, TransferError> {
        std::fs::create_dir_all(temp_dir).map_err(|e| TransferError::Io {
            path: temp_dir.to_path_buf(),
            source: e,
        })?;

        let this = Arc::new(Self {
            transfers: Mutex::new(HashMap::new()),
            registry: TempFileRegistry::new(temp_max_age),
            temp_dir: temp_dir.to_path_buf(),
            stats: RwLock::new(CoordinatorStats::default()),
            cancel: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&this);
        let cancel = this.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                    () = cancel.cancelled() => return,
                }
                let Some(coordinator) = weak.upgrade() else { return };
                coordinator.registry.cleanup();
            }
        });

        Ok(this)
    }

    /// Starts (or reuses) a transfer. An existing record that is not
    /// failed or cancelled is reused as-is; dead records are discarded and
    /// replaced.
    #[instrument(skip(self))]
    pub fn start_transfer(
        &self,
        source: Backend,
        dest: Backend,
        dest_path: &str,
        size: u64,
    ) -> String {
        let id = transfer_key(source, dest, dest_path, size);
        let mut transfers = self.transfers.lock();

        if let Some(existing) = transfers.get(&id) {
            if !matches!(
                existing.status,
                TransferStatus::Failed | TransferStatus::Cancelled
            ) {
                debug!(%id, status = ?existing.status, "reusing live transfer");
                self.stats.write().started += 1;
                return id;
            }
            debug!(%id, "discarding dead transfer record");
            transfers.remove(&id);
        }

        let now = Utc::now();
        transfers.insert(
            id.clone(),
            CrossCloudTransfer {
                transfer_id: id.clone(),
                source,
                dest,
                dest_path: dest_path.to_string(),
                size,
                status: TransferStatus::Pending,
                downloaded_bytes: 0,
                uploaded_bytes: 0,
                temp_path: None,
                content_digest: None,
                started_at: now,
                last_update: now,
                retry_count: 0,
                error_history: Vec::new(),
                metadata: HashMap::new(),
            },
        );
        self.stats.write().started += 1;
        info!(%id, size, "cross-cloud transfer started");
        id
    }

    /// Moves a transfer to `status`. Repeating the current status is a
    /// no-op; moving backwards or out of a terminal state is an error.
    ///
    /// # Errors
    ///
    /// [`TransferError::UnknownTransfer`] or
    /// [`TransferError::InvalidTransition`].
    pub fn update_status(&self, id: &str, status: TransferStatus) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock();
        let transfer = transfers
            .get_mut(id)
            .ok_or_else(|| TransferError::UnknownTransfer { id: id.to_string() })?;

        if transfer.status == status {
            return Ok(());
        }
        if transfer.status.is_terminal() || status.rank() < transfer.status.rank() {
            return Err(TransferError::InvalidTransition {
                id: id.to_string(),
                from: transfer.status,
                to: status,
            });
        }

        debug!(id, from = ?transfer.status, to = ?status, "transfer status change");
        transfer.status = status;
        transfer.last_update = Utc::now();
        Ok(())
    }

    /// Updates byte progress. Values are clamped to the object size, and
    /// uploaded bytes never exceed downloaded bytes.
    ///
    /// # Errors
    ///
    /// [`TransferError::UnknownTransfer`].
    pub fn update_progress(
        &self,
        id: &str,
        downloaded: Option<u64>,
        uploaded: Option<u64>,
    ) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock();
        let transfer = transfers
            .get_mut(id)
            .ok_or_else(|| TransferError::UnknownTransfer { id: id.to_string() })?;

        if let Some(downloaded) = downloaded {
            transfer.downloaded_bytes = downloaded.min(transfer.size);
        }
        if let Some(uploaded) = uploaded {
            transfer.uploaded_bytes = uploaded
                .min(transfer.size)
                .min(transfer.downloaded_bytes);
        }
        transfer.last_update = Utc::now();
        Ok(())
    }

    /// Records a retry attempt with its error.
    ///
    /// # Errors
    ///
    /// [`TransferError::UnknownTransfer`].
    pub fn record_retry(&self, id: &str, error: &str) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock();
        let transfer = transfers
            .get_mut(id)
            .ok_or_else(|| TransferError::UnknownTransfer { id: id.to_string() })?;
        transfer.retry_count += 1;
        push_error(&mut transfer.error_history, error);
        transfer.last_update = Utc::now();
        Ok(())
    }

    /// Finishes a transfer: moves it to `Completed` or `Failed`, updates
    /// the aggregate stats, and removes the live record.
    ///
    /// # Errors
    ///
    /// [`TransferError::UnknownTransfer`].
    #[instrument(skip(self, error))]
    pub fn complete_transfer(
        &self,
        id: &str,
        ok: bool,
        error: Option<&str>,
    ) -> Result<(), TransferError> {
        let mut transfers = self.transfers.lock();
        let mut transfer = transfers
            .remove(id)
            .ok_or_else(|| TransferError::UnknownTransfer { id: id.to_string() })?;

        transfer.status = if ok {
            TransferStatus::Completed
        } else {
            TransferStatus::Failed
        };
        if let Some(error) = error {
            push_error(&mut transfer.error_history, error);
        }

        let mut stats = self.stats.write();
        if ok {
            stats.completed += 1;
            stats.total_bytes += transfer.size;
            info!(id, size = transfer.size, "cross-cloud transfer completed");
        } else {
            stats.failed += 1;
            warn!(id, errors = transfer.error_history.len(), "cross-cloud transfer failed");
        }
        Ok(())
    }

    /// Snapshot of a live transfer.
    #[must_use]
    pub fn transfer(&self, id: &str) -> Option<CrossCloudTransfer> {
        self.transfers.lock().get(id).cloned()
    }

    /// Whether a finished download of this source already exists; bumps
    /// the refcount and counts the avoided duplicate on a hit.
    #[must_use]
    pub fn check_existing_download(
        &self,
        source: Backend,
        src_remote: &str,
        size: u64,
        mod_time_unix: i64,
    ) -> Option<TempFileHandle> {
        let key = source_key(source, src_remote, size, mod_time_unix);
        let handle = self.registry.check_existing(&key, size)?;
        self.stats.write().duplicate_downloads_avoided += 1;
        Some(handle)
    }

    /// Streams `reader` into a coordinator-owned temp file, computing the
    /// content digest on the fly, then registers the file with refcount 1.
    /// Any error removes the partial file.
    ///
    /// # Errors
    ///
    /// [`TransferError::SizeMismatch`] when the stream ends at the wrong
    /// length, [`TransferError::Io`] for disk trouble.
    #[instrument(skip(self, reader))]
    pub async fn save_downloaded_file<R>(
        &self,
        source: Backend,
        src_remote: &str,
        size: u64,
        mod_time_unix: i64,
        mut reader: R,
    ) -> Result<(TempFileHandle, String), TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = source_key(source, src_remote, size, mod_time_unix);
        let file_name = {
            let mut hasher = Sha1::new();
            hasher.update(key.as_bytes());
            format!("{}.part", hex::encode(&hasher.finalize()[..10]))
        };
        let path = self.temp_dir.join(file_name);

        let result = self.stream_to_file(&path, size, &mut reader).await;
        let digest = match result {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        let handle = self.registry.register(&key, &path, size, &digest);
        Ok((handle, digest))
    }

    async fn stream_to_file<R>(
        &self,
        path: &Path,
        expected: u64,
        reader: &mut R,
    ) -> Result<String, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| TransferError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut hasher = Sha1::new();
        let mut written = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await.map_err(|e| TransferError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| TransferError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            written += n as u64;
        }
        file.flush().await.map_err(|e| TransferError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        if written != expected {
            return Err(TransferError::SizeMismatch {
                path: path.to_path_buf(),
                expected,
                actual: written,
            });
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Aggregate counters plus the live-transfer count.
    #[must_use]
    pub fn stats(&self) -> (CoordinatorStats, usize) {
        (self.stats.read().clone(), self.transfers.lock().len())
    }

    /// Runs a temp-file cleanup pass immediately.
    pub fn cleanup_temp_files(&self) -> usize {
        self.registry.cleanup()
    }

    /// Stops the background cleanup loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CrossCloudCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn push_error(history: &mut Vec<String>, error: &str) {
    history.push(error.to_string());
    if history.len() > ERROR_HISTORY_CAP {
        let excess = history.len() - ERROR_HISTORY_CAP;
        history.drain(..excess);
    }
}
