//! Integration tests for the chunked downloader against a scripted
//! adapter, including resume, URL refresh, and cancellation behavior.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use drivebridge::account::AccountingSink;
use drivebridge::backend::{Backend, RemoteHandle, RemoteObject};
use drivebridge::config::Config;
use drivebridge::download::{AdapterLimits, ConcurrentDownloader, DownloadAdapter, DownloadError};
use drivebridge::store::{ResumeRecord, ResumeStore, derive_task_id};

mod support;

/// Serves a fixed byte buffer, with scripted signed-URL expiries.
struct ScriptedAdapter {
    content: Vec<u8>,
    limits: AdapterLimits,
    url_fetches: AtomicU32,
    chunk_calls: Mutex<Vec<(u64, u64)>>,
    /// `(chunk_start, nth_call)` pairs that answer "invalid signature".
    expire_on: Mutex<HashSet<(u64, u32)>>,
    call_counts: Mutex<std::collections::HashMap<u64, u32>>,
}

impl ScriptedAdapter {
    fn new(content: Vec<u8>, chunk_size: u64) -> Self {
        Self {
            content,
            limits: AdapterLimits {
                min_size_for_concurrency: 1,
                max_concurrency: 4,
                default_chunk_size: chunk_size,
                per_chunk_timeout: Duration::from_secs(60),
            },
            url_fetches: AtomicU32::new(0),
            chunk_calls: Mutex::new(Vec::new()),
            expire_on: Mutex::new(HashSet::new()),
            call_counts: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn expire_url(&self, chunk_start: u64, nth_call: u32) {
        self.expire_on.lock().insert((chunk_start, nth_call));
    }

    fn fetched_starts(&self) -> Vec<u64> {
        let mut starts: Vec<u64> = self.chunk_calls.lock().iter().map(|c| c.0).collect();
        starts.sort_unstable();
        starts.dedup();
        starts
    }
}

#[async_trait]
impl DownloadAdapter for ScriptedAdapter {
    fn backend(&self) -> Backend {
        Backend::DriveA
    }

    fn limits(&self) -> AdapterLimits {
        self.limits
    }

    async fn fetch_range_url(
        &self,
        _object: &RemoteObject,
        start: u64,
        end: u64,
    ) -> Result<String, DownloadError> {
        self.url_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(format!("mock://signed/{start}-{end}"))
    }

    async fn download_chunk(
        &self,
        url: &str,
        temp: &Path,
        start: u64,
        end: u64,
        sink: Option<&dyn AccountingSink>,
        _cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let nth = {
            let mut counts = self.call_counts.lock();
            let slot = counts.entry(start).or_insert(0);
            *slot += 1;
            *slot
        };
        if self.expire_on.lock().contains(&(start, nth)) {
            return Err(DownloadError::UrlExpired {
                url: url.to_string(),
            });
        }

        self.chunk_calls.lock().push((start, end));
        let bytes = &self.content[start as usize..=end as usize];

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(temp)
            .await
            .map_err(|e| DownloadError::Io {
                path: temp.to_path_buf(),
                source: e,
            })?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| DownloadError::Io {
                path: temp.to_path_buf(),
                source: e,
            })?;
        file.write_all(bytes).await.map_err(|e| DownloadError::Io {
            path: temp.to_path_buf(),
            source: e,
        })?;
        file.flush().await.map_err(|e| DownloadError::Io {
            path: temp.to_path_buf(),
            source: e,
        })?;

        if let Some(sink) = sink {
            sink.add_bytes(bytes.len() as u64);
        }
        Ok(bytes.len() as u64)
    }

    async fn verify_download(
        &self,
        object: &RemoteObject,
        temp: &Path,
    ) -> Result<(), DownloadError> {
        let data = tokio::fs::read(temp).await.map_err(|e| DownloadError::Io {
            path: temp.to_path_buf(),
            source: e,
        })?;
        if data.len() as u64 != object.size {
            return Err(DownloadError::Verification {
                path: temp.to_path_buf(),
                reason: format!("size {} != {}", data.len(), object.size),
            });
        }
        if data != self.content {
            return Err(DownloadError::Verification {
                path: temp.to_path_buf(),
                reason: "content mismatch".to_string(),
            });
        }
        Ok(())
    }
}

fn object_of(size: u64) -> RemoteObject {
    RemoteObject {
        backend: Backend::DriveA,
        remote_path: "media/movie.bin".to_string(),
        name: "movie.bin".to_string(),
        size,
        mod_time: Utc::now(),
        handle: RemoteHandle {
            file_id: Some("1".to_string()),
            pick_code: Some("pc".to_string()),
        },
        sha1: None,
    }
}

struct Fixture {
    adapter: Arc<ScriptedAdapter>,
    resume: Arc<ResumeStore>,
    downloader: ConcurrentDownloader,
    dest: PathBuf,
    dir: tempfile::TempDir,
}

fn fixture(content: Vec<u8>, chunk_size: u64) -> Fixture {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default().with_cache_dir(dir.path());
    let adapter = Arc::new(ScriptedAdapter::new(content, chunk_size));
    let resume = ResumeStore::open(Backend::DriveA, &config);
    let downloader = ConcurrentDownloader::new(
        Arc::clone(&adapter) as Arc<dyn DownloadAdapter>,
        Arc::clone(&resume),
        config,
    );
    let dest = dir.path().join("movie.part");
    Fixture {
        adapter,
        resume,
        downloader,
        dest,
        dir,
    }
}

fn content_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn downloads_and_verifies_a_chunked_file() {
    let content = content_of(500);
    let f = fixture(content.clone(), 100);
    let cancel = CancellationToken::new();

    let snapshot = f
        .downloader
        .download(&object_of(500), &f.dest, None, &cancel)
        .await
        .unwrap();

    assert_eq!(snapshot.completed, 5);
    assert_eq!(snapshot.bytes, 500);
    assert_eq!(tokio::fs::read(&f.dest).await.unwrap(), content);
    // All five chunks were fetched exactly once.
    assert_eq!(f.adapter.fetched_starts(), vec![0, 100, 200, 300, 400]);
}

#[tokio::test]
async fn single_chunk_boundaries() {
    // size == chunk_size: exactly one chunk.
    let content = content_of(100);
    let f = fixture(content, 100);
    f.downloader
        .download(&object_of(100), &f.dest, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(f.adapter.fetched_starts(), vec![0]);

    // size == chunk_size + 1: two chunks, the second one byte long.
    let content = content_of(101);
    let f = fixture(content, 100);
    f.downloader
        .download(&object_of(101), &f.dest, None, &CancellationToken::new())
        .await
        .unwrap();
    let calls = f.adapter.chunk_calls.lock().clone();
    assert!(calls.contains(&(0, 99)));
    assert!(calls.contains(&(100, 100)));
}

#[tokio::test]
async fn zero_byte_download_starts_no_workers() {
    let f = fixture(Vec::new(), 100);
    f.downloader
        .download(&object_of(0), &f.dest, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(f.adapter.chunk_calls.lock().is_empty());
    assert_eq!(f.adapter.url_fetches.load(Ordering::Relaxed), 0);
    assert_eq!(tokio::fs::metadata(&f.dest).await.unwrap().len(), 0);
}

/// Restart after a partial run: only the missing chunks are fetched and
/// the prior temp file is restored.
#[tokio::test]
async fn resume_fetches_only_missing_chunks() {
    let content = content_of(500);
    let f = fixture(content.clone(), 100);

    // A previous run finished chunks 0-2 and left its temp file behind.
    let prior_temp = f.dir.path().join("prior.part");
    tokio::fs::write(&prior_temp, &content[..300]).await.unwrap();

    let mut record = ResumeRecord::new(Backend::DriveA, "media/movie.bin", "movie.bin", 500, 100);
    for i in 0..3 {
        record.completed_chunks.insert(i, true);
    }
    record.temp_file_path = Some(prior_temp.display().to_string());
    f.resume.save(&record).unwrap();

    let snapshot = f
        .downloader
        .download(&object_of(500), &f.dest, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(snapshot.completed, 5);
    // Only the two missing chunks hit the adapter.
    assert_eq!(f.adapter.fetched_starts(), vec![300, 400]);
    assert_eq!(tokio::fs::read(&f.dest).await.unwrap(), content);
}

/// A stale record (size changed remotely) is discarded and the download
/// starts over.
#[tokio::test]
async fn mismatched_record_starts_fresh() {
    let content = content_of(500);
    let f = fixture(content.clone(), 100);

    let mut record = ResumeRecord::new(Backend::DriveA, "media/movie.bin", "movie.bin", 500, 100);
    record.file_size = 400; // remote changed since
    record.total_chunks = 4;
    record.completed_chunks.insert(0, true);
    // Keep the task id the engine will derive for the current object.
    record.task_id = derive_task_id(Backend::DriveA, "media/movie.bin", 500);
    f.resume.save(&record).unwrap();

    f.downloader
        .download(&object_of(500), &f.dest, None, &CancellationToken::new())
        .await
        .unwrap();
    // All five chunks fetched: nothing was trusted from the stale record.
    assert_eq!(f.adapter.fetched_starts(), vec![0, 100, 200, 300, 400]);
}

/// A signed URL dying mid-chunk triggers one refetch and the chunk still
/// completes exactly once.
#[tokio::test]
async fn url_expiry_mid_chunk_refetches() {
    let content = content_of(300);
    let f = fixture(content.clone(), 100);
    // First attempt on chunk 1 (start 100) answers "invalid signature".
    f.adapter.expire_url(100, 1);

    f.downloader
        .download(&object_of(300), &f.dest, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&f.dest).await.unwrap(), content);
    // 3 initial URL fetches + 1 refresh for the expired chunk.
    assert_eq!(f.adapter.url_fetches.load(Ordering::Relaxed), 4);
    // Chunk 1 was written exactly once.
    let writes = f
        .adapter
        .chunk_calls
        .lock()
        .iter()
        .filter(|c| c.0 == 100)
        .count();
    assert_eq!(writes, 1);

    // Give the async chunk marks a beat, then check the bitmap.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let task_id = derive_task_id(Backend::DriveA, "media/movie.bin", 300);
    let (completed, total, _) = f.resume.progress(&task_id).unwrap();
    assert_eq!((completed, total), (3, 3));
}

#[tokio::test]
async fn cancellation_preserves_the_task() {
    let content = content_of(300);
    let f = fixture(content, 100);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = f
        .downloader
        .download(&object_of(300), &f.dest, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Cancelled));

    // The task record survives for the next attempt.
    let task_id = derive_task_id(Backend::DriveA, "media/movie.bin", 300);
    assert!(f.resume.load(&task_id).unwrap().is_some());
}
