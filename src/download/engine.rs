//! Concurrent chunked download engine.
//!
//! Splits an object into byte-range chunks, runs a semaphore-gated worker
//! pool over them, and records per-chunk completion in the resume store.
//! Chunks complete in any order; the temp file is written by offset, so
//! ordering never matters for correctness. A restarted download validates
//! its previous task record and only fetches the chunks still missing.
//!
//! # Overview
//!
//! 1. Decide participation ([`task::should_download_concurrently`]).
//! 2. Load-or-create the task record; restore a prior temp file if its
//!    byte count matches the completed chunks.
//! 3. Fan out workers under a per-chunk deadline; on a rejected signed URL
//!    a worker refetches the URL and retries within its budget.
//! 4. Verify the finished file and schedule the task record for delayed
//!    deletion so a co-scheduled upload can still find it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::DownloadError;
use super::adapter::DownloadAdapter;
use super::progress::{Progress, ProgressSnapshot};
use super::task::{DownloadOptions, chunk_range, chunk_size_for, max_concurrency};
use crate::account::AccountingSink;
use crate::backend::RemoteObject;
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::store::resume::{ResumeRecord, ResumeStore, derive_task_id};

/// Retries per chunk beyond the first attempt.
const CHUNK_RETRY_BUDGET: u32 = 2;

/// Pause before retrying with a freshly fetched URL.
const URL_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// How long a finished task record lingers for downstream consumers.
const TASK_DELETE_DELAY: Duration = Duration::from_secs(30);

/// Interval between progress annotations on the accounting sink.
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Chunked concurrent downloader over one backend adapter.
pub struct ConcurrentDownloader {
    adapter: Arc<dyn DownloadAdapter>,
    resume: Arc<ResumeStore>,
    config: Config,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ConcurrentDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentDownloader")
            .field("backend", &self.adapter.backend())
            .finish_non_exhaustive()
    }
}

impl ConcurrentDownloader {
    /// Creates a downloader over `adapter`, persisting resume state in
    /// `resume`.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn DownloadAdapter>,
        resume: Arc<ResumeStore>,
        config: Config,
    ) -> Self {
        Self {
            adapter,
            resume,
            config,
            policy: RetryPolicy::default(),
        }
    }

    /// Whether this object/options combination should use the chunked
    /// path. When this returns false the caller falls back to its own
    /// single-stream download.
    #[must_use]
    pub fn should_participate(&self, object: &RemoteObject, options: &DownloadOptions) -> bool {
        super::task::should_download_concurrently(
            self.adapter.backend(),
            object.size,
            options,
            &self.adapter.limits(),
        )
    }

    /// Downloads `object` into `dest`, resuming from a prior task record
    /// when one validates. On success the file at `dest` has exactly
    /// `object.size` bytes and has passed the adapter's verification.
    ///
    /// # Errors
    ///
    /// The first chunk failure (with the total failure count), size or
    /// verification mismatches, or [`DownloadError::Cancelled`]. The task
    /// record survives failures so the next attempt resumes.
    #[instrument(skip(self, object, sink, cancel), fields(path = %object.remote_path, size = object.size))]
    pub async fn download(
        &self,
        object: &RemoteObject,
        dest: &Path,
        sink: Option<Arc<dyn AccountingSink>>,
        cancel: &CancellationToken,
    ) -> Result<ProgressSnapshot, DownloadError> {
        let limits = self.adapter.limits();

        if object.size == 0 {
            // Nothing to chunk: create the empty file and verify.
            tokio::fs::write(dest, b"")
                .await
                .map_err(|e| DownloadError::Io {
                    path: dest.to_path_buf(),
                    source: e,
                })?;
            self.adapter.verify_download(object, dest).await?;
            return Ok(Progress::new(0, 0).snapshot());
        }

        let chunk_size = chunk_size_for(
            object.size,
            limits.default_chunk_size,
            self.config.default_chunk_size,
        );
        let num_chunks = object.size.div_ceil(chunk_size) as u32;
        let width = max_concurrency(num_chunks, limits.max_concurrency, object.size);

        let record = self
            .prepare_task(object, dest, chunk_size, num_chunks)
            .await?;
        let task_id = record.task_id.clone();

        info!(
            %task_id,
            num_chunks,
            chunk_size,
            width,
            resumed_chunks = record.completed_count(),
            "starting chunked download"
        );

        let progress = Arc::new(Progress::new(num_chunks, object.size));
        for (&i, _) in &record.completed_chunks {
            progress.chunk_restored(i, record.chunk_len(i));
        }

        let reporter_cancel = cancel.child_token();
        if let Some(sink) = sink.clone() {
            spawn_reporter(Arc::clone(&progress), sink, reporter_cancel.clone());
        }

        let semaphore = Arc::new(Semaphore::new(width));
        let (err_tx, mut err_rx) = mpsc::channel::<DownloadError>(num_chunks as usize);
        let mut handles = Vec::new();

        for i in 0..num_chunks {
            if record.completed_chunks.contains_key(&i) {
                debug!(%task_id, chunk = i, "skipping completed chunk");
                continue;
            }

            let worker = ChunkWorker {
                adapter: Arc::clone(&self.adapter),
                resume: Arc::clone(&self.resume),
                progress: Arc::clone(&progress),
                policy: self.policy.clone(),
                object: object.clone(),
                dest: dest.to_path_buf(),
                task_id: task_id.clone(),
                chunk_size,
                file_size: object.size,
            };
            let semaphore = Arc::clone(&semaphore);
            let sink = sink.clone();
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let deadline = limits.per_chunk_timeout;

            handles.push(tokio::spawn(async move {
                let outcome =
                    match tokio::time::timeout(deadline, worker.run(i, semaphore, sink, cancel))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(DownloadError::Timeout {
                            operation: format!("chunk {i}"),
                            limit: deadline,
                        }),
                    };
                if let Err(e) = outcome {
                    // Channel is sized to num_chunks, so this never blocks.
                    let _ = err_tx.send(e).await;
                }
            }));
        }
        drop(err_tx);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "chunk worker panicked");
            }
        }
        reporter_cancel.cancel();

        let mut first_error: Option<DownloadError> = None;
        let mut error_count = 0usize;
        while let Some(e) = err_rx.recv().await {
            error_count += 1;
            if first_error.is_none() {
                first_error = Some(e);
            }
        }

        if let Some(first) = first_error {
            warn!(%task_id, error_count, error = %first, "chunked download failed");
            if matches!(first, DownloadError::Cancelled) {
                // Bitmap is preserved; resumption picks up where we left.
                return Err(DownloadError::Cancelled);
            }
            return Err(DownloadError::ChunkFailures {
                first: Box::new(first),
                count: error_count,
            });
        }

        self.finish(object, dest, &task_id).await?;
        Ok(progress.snapshot())
    }

    /// Loads a prior task record if it validates against the current
    /// context; otherwise starts fresh. A usable prior temp file is
    /// copy-restored into `dest`.
    async fn prepare_task(
        &self,
        object: &RemoteObject,
        dest: &Path,
        chunk_size: u64,
        num_chunks: u32,
    ) -> Result<ResumeRecord, DownloadError> {
        let backend = self.adapter.backend();
        let task_id = derive_task_id(backend, &object.remote_path, object.size);

        let prior = self.resume.load(&task_id).unwrap_or_else(|e| {
            warn!(%task_id, error = %e, "resume load failed; starting fresh");
            None
        });

        if let Some(record) = prior {
            match self
                .validate_and_restore(&record, object, dest, num_chunks)
                .await
            {
                Ok(mut record) => {
                    record.temp_file_path = Some(dest.display().to_string());
                    if let Err(e) = self.resume.save(&record) {
                        warn!(%task_id, error = %e, "resume save failed");
                    }
                    return Ok(record);
                }
                Err(reason) => {
                    info!(%task_id, reason, "prior task invalid; starting fresh");
                    let _ = self.resume.delete(&task_id);
                }
            }
        }

        let mut record = ResumeRecord::new(
            backend,
            &object.remote_path,
            &object.name,
            object.size,
            chunk_size,
        );
        record.temp_file_path = Some(dest.display().to_string());
        if let Err(e) = self.resume.save(&record) {
            warn!(task_id = %record.task_id, error = %e, "resume save failed");
        }
        Ok(record)
    }

    /// Checks a loaded record against the current context and restores its
    /// temp file. Returns a human-readable rejection reason on mismatch.
    async fn validate_and_restore(
        &self,
        record: &ResumeRecord,
        object: &RemoteObject,
        dest: &Path,
        num_chunks: u32,
    ) -> Result<ResumeRecord, &'static str> {
        if record.file_size != object.size {
            return Err("file size changed");
        }
        if record.total_chunks != num_chunks {
            return Err("chunk layout changed");
        }
        if record.completed_chunks.keys().any(|&i| i >= num_chunks) {
            return Err("chunk index out of range");
        }
        if record.completed_chunks.is_empty() {
            return Ok(record.clone());
        }

        let Some(prev) = record.temp_file_path.as_deref() else {
            return Err("completed chunks but no temp file recorded");
        };
        let prev_path = PathBuf::from(prev);
        let Ok(meta) = tokio::fs::metadata(&prev_path).await else {
            return Err("prior temp file is gone");
        };
        if meta.len() != record.completed_bytes() {
            return Err("prior temp file size does not match completed chunks");
        }
        if prev_path != dest {
            if let Err(e) = tokio::fs::copy(&prev_path, dest).await {
                warn!(error = %e, "temp file copy-restore failed");
                return Err("temp file copy-restore failed");
            }
            debug!(from = %prev_path.display(), to = %dest.display(), "restored prior temp file");
        }
        Ok(record.clone())
    }

    /// Post-download checks and delayed task cleanup.
    async fn finish(
        &self,
        object: &RemoteObject,
        dest: &Path,
        task_id: &str,
    ) -> Result<(), DownloadError> {
        let meta = tokio::fs::metadata(dest)
            .await
            .map_err(|e| DownloadError::Io {
                path: dest.to_path_buf(),
                source: e,
            })?;
        if meta.len() != object.size {
            let completed = self
                .resume
                .progress(task_id)
                .map(|(completed, _, _)| completed)
                .unwrap_or(0);
            let _ = self.resume.delete(task_id);
            return Err(DownloadError::SizeMismatch {
                path: dest.to_path_buf(),
                expected: object.size,
                actual: meta.len(),
                completed_chunks: completed,
            });
        }

        if let Err(e) = self.adapter.verify_download(object, dest).await {
            let _ = self.resume.delete(task_id);
            return Err(e);
        }

        // Keep the record around briefly: a co-scheduled upload may still
        // want to locate the finished temp file through it.
        let resume = Arc::clone(&self.resume);
        let doomed = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(TASK_DELETE_DELAY).await;
            if let Err(e) = resume.delete(&doomed) {
                warn!(task_id = %doomed, error = %e, "delayed task deletion failed");
            }
        });

        info!(task_id = %task_id, size = object.size, "chunked download verified");
        Ok(())
    }
}

/// Everything one chunk worker needs, bundled to keep the spawn site
/// readable.
struct ChunkWorker {
    adapter: Arc<dyn DownloadAdapter>,
    resume: Arc<ResumeStore>,
    progress: Arc<Progress>,
    policy: RetryPolicy,
    object: RemoteObject,
    dest: PathBuf,
    task_id: String,
    chunk_size: u64,
    file_size: u64,
}

impl ChunkWorker {
    async fn run(
        self,
        index: u32,
        semaphore: Arc<Semaphore>,
        sink: Option<Arc<dyn AccountingSink>>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| DownloadError::Cancelled)?
            }
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        let (start, end) = chunk_range(index, self.chunk_size, self.file_size);
        let mut url = self.adapter.fetch_range_url(&self.object, start, end).await?;

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .adapter
                .download_chunk(
                    &url,
                    &self.dest,
                    start,
                    end,
                    sink.as_deref(),
                    &cancel,
                )
                .await;

            match result {
                Ok(bytes) => {
                    self.progress
                        .chunk_completed(index, bytes, started.elapsed());
                    let resume = Arc::clone(&self.resume);
                    let task_id = self.task_id.clone();
                    // Persistence is off the critical path; a lost mark
                    // only costs a re-download of this chunk.
                    tokio::spawn(async move {
                        if let Err(e) = resume.mark_chunk_completed(&task_id, index) {
                            warn!(%task_id, chunk = index, error = %e, "chunk mark failed");
                        }
                    });
                    debug!(chunk = index, bytes, "chunk complete");
                    return Ok(());
                }
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) if attempt <= CHUNK_RETRY_BUDGET => {
                    if matches!(e, DownloadError::UrlExpired { .. }) {
                        debug!(chunk = index, attempt, "signed URL rejected; refetching");
                        tokio::time::sleep(URL_REFRESH_DELAY).await;
                        url = self.adapter.fetch_range_url(&self.object, start, end).await?;
                    } else {
                        let delay = self.policy.delay(e.category(), attempt, None);
                        debug!(
                            chunk = index,
                            attempt,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "chunk retry"
                        );
                        if !delay.is_zero() {
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn spawn_reporter(
    progress: Arc<Progress>,
    sink: Arc<dyn AccountingSink>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(REPORT_INTERVAL) => {
                    sink.set_annotation(&progress.annotation());
                }
                () = cancel.cancelled() => return,
            }
        }
    });
}
