//! Hash-based instant upload.
//!
//! Presents the content's SHA-1 to the init endpoint. A status-2 answer
//! means the server already holds the bytes and the upload is done without
//! moving any. Status 7 is a proof-of-possession challenge: the server
//! names a byte range and expects its SHA-1 back; the loop answers and
//! re-inits. Status 1 is a miss, handing back the object-storage
//! coordinates for a byte upload.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::source::{SourceFactory, read_range};
use super::{InitUploadRequest, InitUploadResponse, UploadApi, UploadError, UploadedObject};
use crate::retry::RetryPolicy;

/// SHA-1 prefix length used for the pre-id.
pub const PREID_LEN: u64 = 128 * 1024;

/// Challenges answered before giving up on a loop-happy server.
const MAX_SIGN_CHALLENGES: u32 = 5;

/// Init status: server wants the bytes.
const STATUS_NEED_UPLOAD: i64 = 1;
/// Init status: dedup hit.
const STATUS_HIT: i64 = 2;
/// Init status: sign challenge.
const STATUS_SIGN_CHALLENGE: i64 = 7;

/// Outcome of the hash-upload attempt.
#[derive(Debug)]
pub enum HashUploadOutcome {
    /// Dedup hit: the server object, no bytes moved.
    Hit(UploadedObject),
    /// Miss: byte upload required; carries the upload coordinates.
    Miss(InitUploadResponse),
}

/// Full-content and 128 KiB-prefix SHA-1 digests, upper-case hex.
#[derive(Debug, Clone)]
pub struct ContentDigests {
    /// SHA-1 of the whole content.
    pub sha1: String,
    /// SHA-1 of the first 128 KiB (or the whole content when shorter).
    pub preid: String,
}

/// Computes both digests in one pass over the source.
///
/// # Errors
///
/// Source open/read failures.
pub async fn compute_digests(source: &dyn SourceFactory) -> Result<ContentDigests, UploadError> {
    use tokio::io::AsyncReadExt;

    let mut reader = source.open(0).await?;
    let mut full = Sha1::new();
    let mut prefix = Sha1::new();
    let mut prefix_remaining = PREID_LEN;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf).await.map_err(UploadError::io)?;
        if n == 0 {
            break;
        }
        full.update(&buf[..n]);
        if prefix_remaining > 0 {
            let take = (n as u64).min(prefix_remaining) as usize;
            prefix.update(&buf[..take]);
            prefix_remaining -= take as u64;
        }
    }

    Ok(ContentDigests {
        sha1: hex::encode_upper(full.finalize()),
        preid: hex::encode_upper(prefix.finalize()),
    })
}

/// Upper-case SHA-1 of an in-memory slice.
#[must_use]
pub fn sha1_hex_upper(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

/// Attempts an instant upload of `source` into directory `dir_id`.
///
/// `known_sha1` skips the full-content hashing pass when the caller
/// already has the digest.
///
/// # Errors
///
/// Protocol violations, classifier-fatal API errors, or retry exhaustion.
/// A plain miss is not an error; it comes back as
/// [`HashUploadOutcome::Miss`].
#[instrument(skip_all, fields(file_name, size = source.size()))]
pub async fn try_hash_upload(
    api: &dyn UploadApi,
    source: &dyn SourceFactory,
    file_name: &str,
    dir_id: &str,
    known_sha1: Option<&str>,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<HashUploadOutcome, UploadError> {
    let size = source.size();
    if size < 0 {
        return Err(UploadError::Protocol {
            message: "hash upload requires a known size".to_string(),
        });
    }
    let size = size as u64;

    let digests = match known_sha1 {
        Some(sha1) => {
            let prefix_len = PREID_LEN.min(size);
            let prefix = read_range(source, 0, prefix_len).await?;
            ContentDigests {
                sha1: sha1.to_ascii_uppercase(),
                preid: sha1_hex_upper(&prefix),
            }
        }
        None => compute_digests(source).await?,
    };

    let mut request = InitUploadRequest {
        file_name: file_name.to_string(),
        file_size: size,
        target: InitUploadRequest::target_for(dir_id),
        file_id: Some(digests.sha1.clone()),
        preid: Some(digests.preid.clone()),
        ..Default::default()
    };

    for challenge in 0..=MAX_SIGN_CHALLENGES {
        let response = with_retries(policy, cancel, "init_upload", || {
            api.init_upload(&request)
        })
        .await?;

        match response.status {
            STATUS_HIT => {
                let (Some(file_id), Some(pick_code)) =
                    (response.file_id.clone(), response.pick_code.clone())
                else {
                    return Err(UploadError::Protocol {
                        message: "dedup hit without file_id/pick_code".to_string(),
                    });
                };
                info!(%file_id, "instant upload hit");
                return Ok(HashUploadOutcome::Hit(UploadedObject {
                    file_id,
                    pick_code,
                    size,
                    sha1: Some(digests.sha1),
                }));
            }
            STATUS_NEED_UPLOAD => {
                debug!("instant upload miss; byte upload required");
                return Ok(HashUploadOutcome::Miss(response));
            }
            STATUS_SIGN_CHALLENGE => {
                if challenge == MAX_SIGN_CHALLENGES {
                    return Err(UploadError::Protocol {
                        message: format!("server kept challenging after {MAX_SIGN_CHALLENGES} rounds"),
                    });
                }
                let check = response.sign_check.as_deref().unwrap_or_default();
                let (start, end) = parse_sign_check(check)?;
                debug!(start, end, "answering sign challenge");

                let range = with_retries(policy, cancel, "sign_range_read", || {
                    read_range(source, start, end - start + 1)
                })
                .await?;
                request.sign_key = response.sign_key.clone();
                request.sign_val = Some(sha1_hex_upper(&range));
                request.pick_code = response.pick_code.clone();
            }
            other => {
                return Err(UploadError::Protocol {
                    message: format!("unexpected init status {other}"),
                });
            }
        }
    }
    unreachable!("challenge loop always returns")
}

/// Parses a `start-end` (inclusive) sign-check range.
fn parse_sign_check(check: &str) -> Result<(u64, u64), UploadError> {
    let parsed = check.split_once('-').and_then(|(start, end)| {
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        (end >= start).then_some((start, end))
    });
    parsed.ok_or_else(|| UploadError::Protocol {
        message: format!("bad sign_check range: {check:?}"),
    })
}

/// Runs `f` with bounded, jittered backoff per the retry classifier.
/// Fatal categories and exhausted budgets return the last error.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let category = e.category();
                if !policy.should_retry(category, attempt) {
                    return Err(e);
                }
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=500));
                let delay = policy.delay(category, attempt, None) + jitter;
                warn!(
                    operation,
                    attempt,
                    category = %category,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "retrying upload operation"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(UploadError::Cancelled),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::upload::source::BufferedSource;
    use crate::upload::{SamplePolicy, UploadApi};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted init endpoint: pops one response per call.
    struct ScriptedApi {
        responses: Mutex<Vec<InitUploadResponse>>,
        requests: Mutex<Vec<InitUploadRequest>>,
    }

    impl ScriptedApi {
        fn new(mut responses: Vec<InitUploadResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UploadApi for ScriptedApi {
        async fn init_upload(
            &self,
            req: &InitUploadRequest,
        ) -> Result<InitUploadResponse, UploadError> {
            self.requests.lock().push(req.clone());
            self.responses.lock().pop().ok_or(UploadError::Protocol {
                message: "no scripted response".to_string(),
            })
        }

        async fn sample_policy(
            &self,
            _file_name: &str,
            _dir_id: &str,
        ) -> Result<SamplePolicy, UploadError> {
            unimplemented!("not used in hash tests")
        }
    }

    fn hit_response() -> InitUploadResponse {
        InitUploadResponse {
            status: STATUS_HIT,
            file_id: Some("f1".to_string()),
            pick_code: Some("pc1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn immediate_hit() {
        let api = ScriptedApi::new(vec![hit_response()]);
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"hello"));
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let outcome = try_hash_upload(&api, &source, "a.bin", "42", None, &policy, &cancel)
            .await
            .unwrap();
        let HashUploadOutcome::Hit(object) = outcome else {
            panic!("expected hit");
        };
        assert_eq!(object.file_id, "f1");
        assert_eq!(object.size, 5);

        // The request carried an upper-case SHA-1 and the right target.
        let requests = api.requests.lock();
        assert_eq!(requests.len(), 1);
        let sha1 = requests[0].file_id.as_deref().unwrap();
        assert_eq!(sha1, sha1.to_ascii_uppercase());
        assert_eq!(requests[0].target, "U_1_42");
    }

    #[tokio::test]
    async fn miss_returns_coordinates() {
        let api = ScriptedApi::new(vec![InitUploadResponse {
            status: STATUS_NEED_UPLOAD,
            bucket: Some("bkt".to_string()),
            object: Some("obj".to_string()),
            ..Default::default()
        }]);
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"hello"));
        let outcome = try_hash_upload(
            &api,
            &source,
            "a.bin",
            "0",
            None,
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let HashUploadOutcome::Miss(resp) = outcome else {
            panic!("expected miss");
        };
        assert_eq!(resp.bucket.as_deref(), Some("bkt"));
    }

    #[tokio::test]
    async fn sign_challenge_hashes_the_exact_range() {
        // 0..100 bytes; challenge bytes [10, 19].
        let content: Vec<u8> = (0u8..100).collect();
        let expected = sha1_hex_upper(&content[10..20]);

        let api = ScriptedApi::new(vec![
            InitUploadResponse {
                status: STATUS_SIGN_CHALLENGE,
                sign_key: Some("sk".to_string()),
                sign_check: Some("10-19".to_string()),
                ..Default::default()
            },
            hit_response(),
        ]);
        let source = BufferedSource::from_bytes(bytes::Bytes::from(content));

        let outcome = try_hash_upload(
            &api,
            &source,
            "a.bin",
            "0",
            None,
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, HashUploadOutcome::Hit(_)));

        let requests = api.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].sign_key.as_deref(), Some("sk"));
        assert_eq!(requests[1].sign_val.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn known_sha1_skips_full_hash() {
        let api = ScriptedApi::new(vec![hit_response()]);
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"hello"));
        let known = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"; // sha1("hello")

        let outcome = try_hash_upload(
            &api,
            &source,
            "a.bin",
            "0",
            Some(known),
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let HashUploadOutcome::Hit(object) = outcome else {
            panic!("expected hit");
        };
        // Digest is upper-cased on the wire and in the result.
        assert_eq!(object.sha1.as_deref(), Some(known.to_ascii_uppercase().as_str()));
    }

    #[tokio::test]
    async fn unknown_status_is_a_protocol_error() {
        let api = ScriptedApi::new(vec![InitUploadResponse {
            status: 99,
            ..Default::default()
        }]);
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"x"));
        let err = try_hash_upload(
            &api,
            &source,
            "a.bin",
            "0",
            None,
            &RetryPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UploadError::Protocol { .. }));
    }

    #[test]
    fn sign_check_parsing() {
        assert_eq!(parse_sign_check("10-19").unwrap(), (10, 19));
        assert_eq!(parse_sign_check("0-0").unwrap(), (0, 0));
        assert!(parse_sign_check("19-10").is_err());
        assert!(parse_sign_check("abc").is_err());
        assert!(parse_sign_check("").is_err());
    }

    #[tokio::test]
    async fn digests_cover_prefix_and_full() {
        let content = vec![1u8; (PREID_LEN + 10) as usize];
        let source = BufferedSource::from_bytes(bytes::Bytes::from(content.clone()));
        let digests = compute_digests(&source).await.unwrap();
        assert_eq!(digests.sha1, sha1_hex_upper(&content));
        assert_eq!(
            digests.preid,
            sha1_hex_upper(&content[..PREID_LEN as usize])
        );
        assert_ne!(digests.sha1, digests.preid);
    }
}
