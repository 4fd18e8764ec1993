//! Per-backend download capability.
//!
//! The concurrent downloader is backend-agnostic; everything drive-specific
//! goes through [`DownloadAdapter`]: fetching a range-limited signed URL,
//! pulling one byte range into the temp file, and the final integrity
//! check. [`HttpChunkFetcher`] is the shared HTTP plumbing both adapters
//! build on.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{RANGE, RETRY_AFTER};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::DownloadError;
use crate::account::AccountingSink;
use crate::backend::{Backend, RemoteObject};

/// Default HTTP connect timeout (30 seconds).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default read timeout for large-body transfers (10 minutes).
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Tunables an adapter reports to the downloader.
#[derive(Debug, Clone, Copy)]
pub struct AdapterLimits {
    /// Objects below this size are not worth chunking.
    pub min_size_for_concurrency: u64,
    /// Ceiling on parallel chunk fetches against this backend.
    pub max_concurrency: usize,
    /// Fixed chunk size; `0` lets the downloader pick by file size.
    pub default_chunk_size: u64,
    /// Deadline for one chunk, including queueing for a worker slot.
    pub per_chunk_timeout: Duration,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            min_size_for_concurrency: 50 * 1024 * 1024,
            max_concurrency: 4,
            default_chunk_size: 0,
            per_chunk_timeout: Duration::from_secs(600),
        }
    }
}

/// Backend-specific download operations consumed by the downloader.
#[async_trait]
pub trait DownloadAdapter: Send + Sync {
    /// Which drive this adapter talks to.
    fn backend(&self) -> Backend;

    /// Adapter tunables.
    fn limits(&self) -> AdapterLimits;

    /// Returns a time-limited signed URL valid for `[start, end]` of
    /// `object`.
    async fn fetch_range_url(
        &self,
        object: &RemoteObject,
        start: u64,
        end: u64,
    ) -> Result<String, DownloadError>;

    /// Downloads `[start, end]` of `url` into `temp` at offset `start`,
    /// reporting incremental byte counts to `sink`. Returns bytes written.
    ///
    /// Must fail with [`DownloadError::UrlExpired`] when the remote rejects
    /// the signed URL, so the caller can retry with a fresh one.
    async fn download_chunk(
        &self,
        url: &str,
        temp: &Path,
        start: u64,
        end: u64,
        sink: Option<&dyn AccountingSink>,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError>;

    /// Final integrity check over the completed temp file (size, and a
    /// content hash where the backend exposes one cheaply).
    async fn verify_download(
        &self,
        object: &RemoteObject,
        temp: &Path,
    ) -> Result<(), DownloadError>;
}

/// Shared HTTP range fetcher: GET with a `Range` header, streamed to the
/// temp file at the chunk's offset.
#[derive(Debug, Clone)]
pub struct HttpChunkFetcher {
    client: Client,
}

impl Default for HttpChunkFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChunkFetcher {
    /// Creates a fetcher with the default large-body timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .gzip(false)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Fetches `[start, end]` of `url` and writes it into `temp` at offset
    /// `start`. Returns the byte count written.
    ///
    /// # Errors
    ///
    /// [`DownloadError::UrlExpired`] when the server rejects the signed
    /// URL, [`DownloadError::Http`] for other error statuses,
    /// [`DownloadError::Network`] / [`DownloadError::Io`] for transport and
    /// disk failures, and [`DownloadError::Cancelled`] when `cancel` fires
    /// mid-stream.
    #[instrument(level = "debug", skip(self, sink, cancel), fields(len = end - start + 1))]
    pub async fn fetch_range(
        &self,
        url: &str,
        temp: &Path,
        start: u64,
        end: u64,
        sink: Option<&dyn AccountingSink>,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| DownloadError::Network {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(DownloadError::from_response(
                url,
                status.as_u16(),
                &body,
                retry_after,
            ));
        }

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

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            };
            let Some(item) = next else { break };
            let bytes = item.map_err(|e| DownloadError::Network {
                url: url.to_string(),
                source: e,
            })?;
            file.write_all(&bytes).await.map_err(|e| DownloadError::Io {
                path: temp.to_path_buf(),
                source: e,
            })?;
            written += bytes.len() as u64;
            if let Some(sink) = sink {
                sink.add_bytes(bytes.len() as u64);
            }
        }

        file.flush().await.map_err(|e| DownloadError::Io {
            path: temp.to_path_buf(),
            source: e,
        })?;

        let expected = end - start + 1;
        if written != expected {
            debug!(written, expected, "short range response");
            return Err(DownloadError::SizeMismatch {
                path: temp.to_path_buf(),
                expected,
                actual: written,
                completed_chunks: 0,
            });
        }

        trace!(written, "chunk written");
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::RecordingSink;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_range_writes_at_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chunk"))
            .and(header("range", "bytes=4-7"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"DEFG".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("part");
        tokio::fs::write(&temp, b"abcd....").await.unwrap();

        let fetcher = HttpChunkFetcher::new();
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let written = fetcher
            .fetch_range(
                &format!("{}/chunk", server.uri()),
                &temp,
                4,
                7,
                Some(&sink),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(sink.bytes(), 4);
        let content = tokio::fs::read(&temp).await.unwrap();
        assert_eq!(&content, b"abcdDEFG");
    }

    #[tokio::test]
    async fn rejected_signature_maps_to_url_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid signature"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("part");
        let fetcher = HttpChunkFetcher::new();
        let cancel = CancellationToken::new();
        let err = fetcher
            .fetch_range(&server.uri(), &temp, 0, 3, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::UrlExpired { .. }));
    }

    #[tokio::test]
    async fn short_body_fails_the_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"ab".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("part");
        let fetcher = HttpChunkFetcher::new();
        let cancel = CancellationToken::new();
        let err = fetcher
            .fetch_range(&server.uri(), &temp, 0, 9, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::SizeMismatch { .. }));
    }
}
