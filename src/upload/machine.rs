//! The upload state machine.
//!
//! Chooses exactly one path per upload from the caller's mode, the content
//! size, and the configured cutoffs:
//!
//! - **OnlyStream**: sample-stream or nothing.
//! - **FastUpload**: dedup attempt, then sample-stream when it fits,
//!   multipart otherwise.
//! - **HashOnly**: dedup attempt or failure; never moves bytes.
//! - **Default**: dedup attempt, then object storage (multipart above the
//!   cutoff or when the size is unknown, single put below it).
//!
//! A dedup hit is logically a server-side copy: the accounting sink is
//! marked so no client-side byte counting is attributed to it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::hash::{HashUploadOutcome, try_hash_upload, with_retries};
use super::multipart::{multipart_upload, put_object_upload};
use super::sample::SampleUploader;
use super::source::{BufferedSource, SourceFactory};
use super::{
    CachedCredentials, InitUploadRequest, InitUploadResponse, ObjectStore, UploadApi,
    UploadError, UploadedObject,
};
use crate::account::AccountingSink;
use crate::config::Config;
use crate::retry::RetryPolicy;

/// Which path family the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadMode {
    /// Dedup attempt, then object storage.
    #[default]
    Default,
    /// Dedup attempt, then the cheapest byte path.
    FastUpload,
    /// Dedup attempt only; fail on miss. Used for presence checks.
    HashOnly,
    /// Sample-stream only; fail when the content does not fit.
    OnlyStream,
}

/// Caller options for one upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Path family.
    pub mode: UploadMode,
    /// Destination directory id.
    pub dir_id: String,
    /// Leaf file name.
    pub file_name: String,
    /// SHA-1 the caller already knows, lower- or upper-case hex.
    pub known_sha1: Option<String>,
    /// HTTP headers forwarded to the object-storage upload
    /// (content-type, cache-control, content-disposition,
    /// content-encoding, and `x-*-meta-*` passthrough).
    pub headers: HashMap<String, String>,
}

/// Drives an upload through exactly one of the four paths.
pub struct UploadStateMachine {
    api: Arc<dyn UploadApi>,
    credentials: CachedCredentials,
    store: Arc<dyn ObjectStore>,
    sample: SampleUploader,
    config: Config,
    policy: RetryPolicy,
}

impl std::fmt::Debug for UploadStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadStateMachine").finish_non_exhaustive()
    }
}

impl UploadStateMachine {
    /// Creates a machine over the drive API, credentials endpoint, and
    /// object-storage capability.
    #[must_use]
    pub fn new(
        api: Arc<dyn UploadApi>,
        credentials: CachedCredentials,
        store: Arc<dyn ObjectStore>,
        config: Config,
    ) -> Self {
        Self {
            api,
            credentials,
            store,
            sample: SampleUploader::new(),
            config,
            policy: RetryPolicy::default(),
        }
    }

    /// Uploads `source` and returns the server-side object.
    ///
    /// # Errors
    ///
    /// [`UploadError::NotPossible`] when the mode/size combination has no
    /// path (never retryable), otherwise the chosen path's errors.
    #[instrument(skip_all, fields(mode = ?options.mode, name = options.file_name, size = source.size()))]
    pub async fn upload(
        &self,
        source: Arc<dyn SourceFactory>,
        options: &UploadOptions,
        sink: Option<Arc<dyn AccountingSink>>,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, UploadError> {
        let size = source.size();

        // Zero-byte content always goes through the sample path; every
        // other route needs bytes to hash or part up.
        if size == 0 {
            debug!("empty source, using sample path");
            return self.sample_upload(&*source, options, sink, cancel).await;
        }

        match options.mode {
            UploadMode::OnlyStream => {
                if size < 0 || size as u64 <= self.config.stream_upload_limit {
                    self.sample_upload(&*source, options, sink, cancel).await
                } else {
                    Err(UploadError::NotPossible {
                        reason: format!(
                            "content of {size} bytes exceeds the stream upload limit"
                        ),
                    })
                }
            }

            UploadMode::HashOnly => {
                let source = self.ensure_sized(source).await?;
                match self.hash_attempt(&*source, options, &sink, cancel).await? {
                    HashUploadOutcome::Hit(object) => Ok(object),
                    HashUploadOutcome::Miss(_) => Err(UploadError::NotPossible {
                        reason: "content not present server-side (hash-only mode)".to_string(),
                    }),
                }
            }

            UploadMode::FastUpload => {
                if size >= 0 && size as u64 <= self.config.no_hash_size {
                    return self.sample_upload(&*source, options, sink, cancel).await;
                }

                let mut miss: Option<InitUploadResponse> = None;
                if size >= 0 {
                    match self.hash_attempt(&*source, options, &sink, cancel).await? {
                        HashUploadOutcome::Hit(object) => return Ok(object),
                        HashUploadOutcome::Miss(resp) => miss = Some(resp),
                    }
                }

                if size < 0 || size as u64 <= self.config.stream_upload_limit {
                    self.sample_upload(&*source, options, sink, cancel).await
                } else {
                    let init = match miss {
                        Some(init) => init,
                        None => self.direct_init(&*source, options, cancel).await?,
                    };
                    multipart_upload(
                        &*self.store,
                        &self.credentials,
                        &init,
                        &*source,
                        &options.headers,
                        &self.policy,
                        sink.as_deref(),
                        cancel,
                    )
                    .await
                }
            }

            UploadMode::Default => {
                if size >= 0 && (size as u64) < self.config.no_hash_size {
                    return self.sample_upload(&*source, options, sink, cancel).await;
                }

                if size < 0 {
                    // Unknown size skips the dedup attempt entirely; the
                    // init call still grants the byte-upload coordinates.
                    let init = self.direct_init(&*source, options, cancel).await?;
                    return multipart_upload(
                        &*self.store,
                        &self.credentials,
                        &init,
                        &*source,
                        &options.headers,
                        &self.policy,
                        sink.as_deref(),
                        cancel,
                    )
                    .await;
                }

                match self.hash_attempt(&*source, options, &sink, cancel).await? {
                    HashUploadOutcome::Hit(object) => Ok(object),
                    HashUploadOutcome::Miss(init) => {
                        if size as u64 >= self.config.upload_cutoff {
                            multipart_upload(
                                &*self.store,
                                &self.credentials,
                                &init,
                                &*source,
                                &options.headers,
                                &self.policy,
                                sink.as_deref(),
                                cancel,
                            )
                            .await
                        } else {
                            put_object_upload(
                                &*self.store,
                                &self.credentials,
                                &init,
                                &*source,
                                &options.headers,
                                &self.policy,
                                sink.as_deref(),
                                cancel,
                            )
                            .await
                        }
                    }
                }
            }
        }
    }

    /// Hash attempt with server-side-copy accounting on a hit.
    async fn hash_attempt(
        &self,
        source: &dyn SourceFactory,
        options: &UploadOptions,
        sink: &Option<Arc<dyn AccountingSink>>,
        cancel: &CancellationToken,
    ) -> Result<HashUploadOutcome, UploadError> {
        let outcome = try_hash_upload(
            &*self.api,
            source,
            &options.file_name,
            &options.dir_id,
            options.known_sha1.as_deref(),
            &self.policy,
            cancel,
        )
        .await?;
        if let (HashUploadOutcome::Hit(object), Some(sink)) = (&outcome, sink) {
            // No bytes traverse the client; attribute the logical size.
            sink.server_side_transfer_start();
            sink.server_side_copy_end(object.size);
            info!(file_id = %object.file_id, "upload satisfied server-side");
        }
        Ok(outcome)
    }

    /// Init call without a content hash: no dedup, just byte-upload
    /// coordinates. Used when the size (and therefore the hash) is
    /// unavailable up front.
    async fn direct_init(
        &self,
        source: &dyn SourceFactory,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<InitUploadResponse, UploadError> {
        let request = InitUploadRequest {
            file_name: options.file_name.clone(),
            file_size: source.size().max(0) as u64,
            target: InitUploadRequest::target_for(&options.dir_id),
            ..Default::default()
        };
        let response = with_retries(&self.policy, cancel, "init_upload_direct", || {
            self.api.init_upload(&request)
        })
        .await?;
        if response.status != 1 {
            return Err(UploadError::Protocol {
                message: format!(
                    "expected byte-upload grant, got init status {}",
                    response.status
                ),
            });
        }
        Ok(response)
    }

    async fn sample_upload(
        &self,
        source: &dyn SourceFactory,
        options: &UploadOptions,
        sink: Option<Arc<dyn AccountingSink>>,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, UploadError> {
        let policy = with_retries(&self.policy, cancel, "sample_policy", || {
            self.api.sample_policy(&options.file_name, &options.dir_id)
        })
        .await?;
        self.sample
            .upload(&policy, source, &options.file_name, sink, cancel)
            .await
    }

    /// Guarantees a seekable, sized source: unknown-size streams are
    /// buffered (spilling past the memory threshold).
    async fn ensure_sized(
        &self,
        source: Arc<dyn SourceFactory>,
    ) -> Result<Arc<dyn SourceFactory>, UploadError> {
        if source.size() >= 0 {
            return Ok(source);
        }
        debug!("buffering unknown-size source for hashing");
        let reader = source.open(0).await?;
        let buffered = BufferedSource::buffer(reader, self.config.max_memory_buffer).await?;
        Ok(Arc::new(buffered))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::RecordingSink;
    use crate::upload::{CredentialsProvider, ObjectStoreCredentials, SamplePolicy};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeApi {
        init_responses: Mutex<Vec<InitUploadResponse>>,
        init_calls: AtomicU32,
    }

    impl FakeApi {
        fn new(mut responses: Vec<InitUploadResponse>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                init_responses: Mutex::new(responses),
                init_calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl UploadApi for FakeApi {
        async fn init_upload(
            &self,
            _req: &InitUploadRequest,
        ) -> Result<InitUploadResponse, UploadError> {
            self.init_calls.fetch_add(1, Ordering::Relaxed);
            self.init_responses.lock().pop().ok_or(UploadError::Protocol {
                message: "unexpected init call".to_string(),
            })
        }

        async fn sample_policy(
            &self,
            _file_name: &str,
            _dir_id: &str,
        ) -> Result<SamplePolicy, UploadError> {
            Err(UploadError::NotPossible {
                reason: "sample endpoint disabled in this test".to_string(),
            })
        }
    }

    struct FakeCreds;

    #[async_trait]
    impl CredentialsProvider for FakeCreds {
        async fn fetch(&self) -> Result<ObjectStoreCredentials, UploadError> {
            Ok(ObjectStoreCredentials {
                access_key_id: "id".into(),
                access_key_secret: "secret".into(),
                security_token: "token".into(),
                expiration: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    #[derive(Default)]
    struct FakeStore {
        parts: Mutex<Vec<(u32, usize)>>,
        put_calls: AtomicU32,
        multipart_calls: AtomicU32,
        aborted: AtomicU32,
    }

    fn callback_json() -> serde_json::Value {
        serde_json::json!({
            "state": true,
            "data": {"file_id": "900", "pick_code": "pc900", "file_size": 1}
        })
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn initiate_multipart(
            &self,
            _creds: &ObjectStoreCredentials,
            _bucket: &str,
            _key: &str,
            _headers: &HashMap<String, String>,
        ) -> Result<String, UploadError> {
            self.multipart_calls.fetch_add(1, Ordering::Relaxed);
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _creds: &ObjectStoreCredentials,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            part_number: u32,
            body: Bytes,
        ) -> Result<String, UploadError> {
            self.parts.lock().push((part_number, body.len()));
            Ok(format!("etag-{part_number}"))
        }

        async fn complete_multipart(
            &self,
            _creds: &ObjectStoreCredentials,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
            _parts: &[(u32, String)],
            _callback: Option<&str>,
            _callback_var: Option<&str>,
        ) -> Result<serde_json::Value, UploadError> {
            Ok(callback_json())
        }

        async fn abort_multipart(
            &self,
            _creds: &ObjectStoreCredentials,
            _bucket: &str,
            _key: &str,
            _upload_id: &str,
        ) -> Result<(), UploadError> {
            self.aborted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn put_object(
            &self,
            _creds: &ObjectStoreCredentials,
            _bucket: &str,
            _key: &str,
            _body: Bytes,
            _headers: &HashMap<String, String>,
            _callback: Option<&str>,
            _callback_var: Option<&str>,
        ) -> Result<serde_json::Value, UploadError> {
            self.put_calls.fetch_add(1, Ordering::Relaxed);
            Ok(callback_json())
        }
    }

    fn hit() -> InitUploadResponse {
        InitUploadResponse {
            status: 2,
            file_id: Some("f77".to_string()),
            pick_code: Some("pc77".to_string()),
            ..Default::default()
        }
    }

    fn miss() -> InitUploadResponse {
        InitUploadResponse {
            status: 1,
            bucket: Some("bkt".to_string()),
            object: Some("obj".to_string()),
            ..Default::default()
        }
    }

    fn machine(api: Arc<FakeApi>, store: Arc<FakeStore>, config: Config) -> UploadStateMachine {
        UploadStateMachine::new(
            api,
            CachedCredentials::new(Arc::new(FakeCreds)),
            store,
            config,
        )
    }

    fn options() -> UploadOptions {
        UploadOptions {
            dir_id: "0".to_string(),
            file_name: "a.bin".to_string(),
            ..Default::default()
        }
    }

    fn source_of(len: usize) -> Arc<dyn SourceFactory> {
        Arc::new(BufferedSource::from_bytes(Bytes::from(vec![9u8; len])))
    }

    /// Instant-upload hit: one init call, zero storage traffic, bytes
    /// attributed as a server-side copy.
    #[tokio::test]
    async fn dedup_hit_moves_no_bytes() {
        let api = FakeApi::new(vec![hit()]);
        let store = Arc::new(FakeStore::default());
        // no_hash_size below the content so the hash path runs.
        let config = Config::default().with_upload_cutoff(10 * 1024 * 1024);
        let m = machine(Arc::clone(&api), Arc::clone(&store), config);

        let sink = Arc::new(RecordingSink::new());
        let object = m
            .upload(
                source_of(5 * 1024 * 1024),
                &options(),
                Some(sink.clone() as Arc<dyn AccountingSink>),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(object.file_id, "f77");
        assert_eq!(api.init_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.multipart_calls.load(Ordering::Relaxed), 0);
        assert_eq!(store.put_calls.load(Ordering::Relaxed), 0);
        assert_eq!(sink.bytes(), 0);
        assert_eq!(sink.server_side_bytes(), 5 * 1024 * 1024);
    }

    /// Default mode, miss, size above the cutoff: multipart.
    #[tokio::test]
    async fn default_miss_above_cutoff_goes_multipart() {
        let api = FakeApi::new(vec![miss()]);
        let store = Arc::new(FakeStore::default());
        let config = Config::default().with_upload_cutoff(1024);
        let m = machine(api, Arc::clone(&store), config);

        let object = m
            .upload(
                source_of(4096),
                &options(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(object.file_id, "900");
        assert_eq!(store.multipart_calls.load(Ordering::Relaxed), 1);
        assert!(!store.parts.lock().is_empty());
    }

    /// Default mode, miss, size below the cutoff: single put.
    #[tokio::test]
    async fn default_miss_below_cutoff_uses_put() {
        let api = FakeApi::new(vec![miss()]);
        let store = Arc::new(FakeStore::default());
        let config = Config::default(); // cutoff 200 MiB
        let m = machine(api, Arc::clone(&store), config);

        m.upload(
            source_of(2 * 1024 * 1024),
            &options(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(store.put_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.multipart_calls.load(Ordering::Relaxed), 0);
    }

    /// Unknown size skips the hash attempt and goes straight to
    /// multipart coordinates.
    #[tokio::test]
    async fn unknown_size_skips_hashing() {
        struct UnknownSource(Bytes);

        #[async_trait]
        impl SourceFactory for UnknownSource {
            fn size(&self) -> i64 {
                -1
            }
            async fn open(
                &self,
                offset: u64,
            ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, UploadError> {
                Ok(Box::new(std::io::Cursor::new(
                    self.0.slice((offset as usize).min(self.0.len())..),
                )))
            }
        }

        let api = FakeApi::new(vec![miss()]);
        let store = Arc::new(FakeStore::default());
        let m = machine(Arc::clone(&api), Arc::clone(&store), Config::default());

        let source: Arc<dyn SourceFactory> = Arc::new(UnknownSource(Bytes::from(vec![1u8; 100])));
        m.upload(source, &options(), None, &CancellationToken::new())
            .await
            .unwrap();

        // Exactly one init (the direct grant) and a multipart upload.
        assert_eq!(api.init_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.multipart_calls.load(Ordering::Relaxed), 1);
    }

    /// Hash-only mode fails non-retryably on a miss.
    #[tokio::test]
    async fn hash_only_miss_is_not_possible() {
        let api = FakeApi::new(vec![miss()]);
        let store = Arc::new(FakeStore::default());
        let mut opts = options();
        opts.mode = UploadMode::HashOnly;
        let m = machine(api, Arc::clone(&store), Config::default());

        let err = m
            .upload(
                source_of(2 * 1024 * 1024),
                &opts,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotPossible { .. }));
        assert_eq!(err.category(), crate::retry::ErrorCategory::Fatal);
        // A presence check never touches the storage layer.
        assert_eq!(store.multipart_calls.load(Ordering::Relaxed), 0);
        assert_eq!(store.put_calls.load(Ordering::Relaxed), 0);
    }

    /// OnlyStream refuses oversize content outright.
    #[tokio::test]
    async fn only_stream_oversize_fails() {
        let api = FakeApi::new(vec![]);
        let store = Arc::new(FakeStore::default());
        let config = Config::default().with_stream_upload_limit(1024);
        let mut opts = options();
        opts.mode = UploadMode::OnlyStream;
        let m = machine(api, store, config);

        let err = m
            .upload(source_of(4096), &opts, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotPossible { .. }));
    }

    /// FastUpload above the stream limit falls back to multipart after a
    /// miss, reusing the miss's coordinates (no second init).
    #[tokio::test]
    async fn fast_upload_large_miss_reuses_coordinates() {
        let api = FakeApi::new(vec![miss()]);
        let store = Arc::new(FakeStore::default());
        let mut config = Config::default()
            .with_stream_upload_limit(1024)
            .with_upload_cutoff(1024);
        config.no_hash_size = 1024;
        let mut opts = options();
        opts.mode = UploadMode::FastUpload;
        let m = machine(Arc::clone(&api), Arc::clone(&store), config);

        m.upload(source_of(8192), &opts, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(api.init_calls.load(Ordering::Relaxed), 1);
        assert_eq!(store.multipart_calls.load(Ordering::Relaxed), 1);
    }

    /// Multipart parts are sequential and sized by the calculator.
    #[tokio::test]
    async fn multipart_parts_are_sequential() {
        let api = FakeApi::new(vec![miss()]);
        let store = Arc::new(FakeStore::default());
        let config = Config::default().with_upload_cutoff(1024);
        let m = machine(api, Arc::clone(&store), config);

        // 40 MiB at the 16 MiB default part size: parts of 16, 16, 8 MiB.
        m.upload(
            source_of(40 * 1024 * 1024),
            &options(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let parts = store.parts.lock();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], (1, 16 * 1024 * 1024));
        assert_eq!(parts[1], (2, 16 * 1024 * 1024));
        assert_eq!(parts[2], (3, 8 * 1024 * 1024));
    }
}
