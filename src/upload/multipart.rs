//! Byte upload through the object-storage layer.
//!
//! Multipart for large or unknown-size content, single-request put for
//! everything else. Parts are uploaded sequentially by contract: the
//! storage SDK already parallelizes at the TCP level, and a second layer
//! of concurrency here only fragments the connection pool.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::hash::with_retries;
use super::source::SourceFactory;
use super::{
    CachedCredentials, InitUploadResponse, ObjectStore, UploadError, UploadedObject,
    parse_callback,
};
use crate::account::AccountingSink;
use crate::config::MIB;
use crate::retry::RetryPolicy;

/// Baseline part size (16 MiB).
const DEFAULT_PART_SIZE: u64 = 16 * MIB;

/// Hard ceiling on part count imposed by the storage layer.
pub const MAX_PARTS: u64 = 10_000;

/// Picks the effective part size for `size` bytes so the upload fits in
/// [`MAX_PARTS`] parts. Unknown sizes get the baseline and rely on the
/// server tolerating long tails.
#[must_use]
pub fn part_size_for(size: i64, max_parts: u64) -> u64 {
    if size < 0 {
        return DEFAULT_PART_SIZE;
    }
    let needed = (size as u64).div_ceil(max_parts.max(1));
    if needed <= DEFAULT_PART_SIZE {
        DEFAULT_PART_SIZE
    } else {
        // Round up to a whole MiB to keep offsets friendly.
        needed.div_ceil(MIB) * MIB
    }
}

fn coordinates(init: &InitUploadResponse) -> Result<(&str, &str), UploadError> {
    match (init.bucket.as_deref(), init.object.as_deref()) {
        (Some(bucket), Some(object)) => Ok((bucket, object)),
        _ => Err(UploadError::Protocol {
            message: "init response missing bucket/object".to_string(),
        }),
    }
}

/// Streams `source` through a sequential multipart upload and resolves the
/// completion callback. On unrecoverable failure the multipart session is
/// aborted server-side.
///
/// # Errors
///
/// Storage/API failures after retries, or [`UploadError::Cancelled`].
#[instrument(skip_all, fields(size = source.size()))]
pub async fn multipart_upload(
    store: &dyn ObjectStore,
    credentials: &CachedCredentials,
    init: &InitUploadResponse,
    source: &dyn SourceFactory,
    headers: &HashMap<String, String>,
    policy: &RetryPolicy,
    sink: Option<&dyn AccountingSink>,
    cancel: &CancellationToken,
) -> Result<UploadedObject, UploadError> {
    let (bucket, key) = coordinates(init)?;
    let part_size = part_size_for(source.size(), MAX_PARTS);

    let creds = credentials.get().await?;
    let upload_id = with_retries(policy, cancel, "initiate_multipart", || {
        let creds = creds.clone();
        async move {
            store
                .initiate_multipart(&creds, bucket, key, headers)
                .await
        }
    })
    .await?;
    debug!(%upload_id, part_size, "multipart upload started");

    match stream_parts(
        store,
        credentials,
        bucket,
        key,
        &upload_id,
        source,
        part_size,
        policy,
        sink,
        cancel,
    )
    .await
    {
        Ok(parts) => {
            let creds = credentials.get().await?;
            let callback = with_retries(policy, cancel, "complete_multipart", || {
                let creds = creds.clone();
                let parts = parts.clone();
                let upload_id = upload_id.clone();
                async move {
                    store
                        .complete_multipart(
                            &creds,
                            bucket,
                            key,
                            &upload_id,
                            &parts,
                            init.callback.as_deref(),
                            init.callback_var.as_deref(),
                        )
                        .await
                }
            })
            .await?;
            let object = parse_callback(&callback)?;
            info!(parts = parts.len(), file_id = %object.file_id, "multipart upload complete");
            Ok(object)
        }
        Err(e) => {
            // Server-side cleanup; the error we report is the original one.
            if let Ok(creds) = credentials.get().await {
                if let Err(abort_err) =
                    store.abort_multipart(&creds, bucket, key, &upload_id).await
                {
                    warn!(%upload_id, error = %abort_err, "multipart abort failed");
                }
            }
            Err(e)
        }
    }
}

/// Reads the source sequentially and uploads each buffered part with
/// retries. Buffered parts make retry safe without rewinding the source.
#[allow(clippy::too_many_arguments)]
async fn stream_parts(
    store: &dyn ObjectStore,
    credentials: &CachedCredentials,
    bucket: &str,
    key: &str,
    upload_id: &str,
    source: &dyn SourceFactory,
    part_size: u64,
    policy: &RetryPolicy,
    sink: Option<&dyn AccountingSink>,
    cancel: &CancellationToken,
) -> Result<Vec<(u32, String)>, UploadError> {
    let mut reader = source.open(0).await?;
    let mut parts: Vec<(u32, String)> = Vec::new();
    let mut part_number = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let mut buf = Vec::with_capacity(part_size as usize);
        let n = (&mut reader)
            .take(part_size)
            .read_to_end(&mut buf)
            .await
            .map_err(UploadError::io)?;
        if n == 0 {
            if part_number == 0 {
                // Zero-byte object still needs one (empty) part.
                part_number = 1;
                let etag = upload_one(
                    store,
                    credentials,
                    bucket,
                    key,
                    upload_id,
                    part_number,
                    Bytes::new(),
                    policy,
                    cancel,
                )
                .await?;
                parts.push((part_number, etag));
            }
            break;
        }

        part_number += 1;
        let body = Bytes::from(buf);
        let etag = upload_one(
            store,
            credentials,
            bucket,
            key,
            upload_id,
            part_number,
            body,
            policy,
            cancel,
        )
        .await?;
        if let Some(sink) = sink {
            sink.add_bytes(n as u64);
        }
        parts.push((part_number, etag));
    }
    Ok(parts)
}

#[allow(clippy::too_many_arguments)]
async fn upload_one(
    store: &dyn ObjectStore,
    credentials: &CachedCredentials,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: u32,
    body: Bytes,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<String, UploadError> {
    with_retries(policy, cancel, "upload_part", || {
        let body = body.clone();
        async move {
            // Credentials are re-read per attempt so a refresh mid-upload
            // is picked up.
            let creds = credentials.get().await?;
            store
                .upload_part(&creds, bucket, key, upload_id, part_number, body)
                .await
        }
    })
    .await
}

/// Single-request put for content under the multipart cutoff. The body is
/// re-read from the source per attempt, which is what makes retry safe; a
/// source that cannot reopen fails permanently.
///
/// # Errors
///
/// Storage/API failures after retries, [`UploadError::SourceNotReopenable`]
/// when a retry cannot rewind.
#[instrument(skip_all, fields(size = source.size()))]
pub async fn put_object_upload(
    store: &dyn ObjectStore,
    credentials: &CachedCredentials,
    init: &InitUploadResponse,
    source: &dyn SourceFactory,
    headers: &HashMap<String, String>,
    policy: &RetryPolicy,
    sink: Option<&dyn AccountingSink>,
    cancel: &CancellationToken,
) -> Result<UploadedObject, UploadError> {
    let (bucket, key) = coordinates(init)?;

    let callback = with_retries(policy, cancel, "put_object", || async move {
        let mut reader = source.open(0).await.map_err(|e| match e {
            UploadError::Io { source, .. } => UploadError::SourceNotReopenable {
                reason: source.to_string(),
            },
            other => other,
        })?;
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .await
            .map_err(UploadError::io)?;
        let len = body.len() as u64;

        let creds = credentials.get().await?;
        let callback = store
            .put_object(
                &creds,
                bucket,
                key,
                Bytes::from(body),
                headers,
                init.callback.as_deref(),
                init.callback_var.as_deref(),
            )
            .await?;
        if let Some(sink) = sink {
            sink.add_bytes(len);
        }
        Ok(callback)
    })
    .await?;

    let object = parse_callback(&callback)?;
    info!(file_id = %object.file_id, "single-part upload complete");
    Ok(object)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::GIB;

    #[test]
    fn part_size_defaults() {
        assert_eq!(part_size_for(-1, MAX_PARTS), DEFAULT_PART_SIZE);
        assert_eq!(part_size_for(0, MAX_PARTS), DEFAULT_PART_SIZE);
        assert_eq!(part_size_for((GIB) as i64, MAX_PARTS), DEFAULT_PART_SIZE);
    }

    #[test]
    fn part_size_scales_for_huge_objects() {
        // 200 GiB / 10_000 parts = 20.97 MB -> rounds up to 21 MiB.
        let size = (200 * GIB) as i64;
        let part = part_size_for(size, MAX_PARTS);
        assert!(part > DEFAULT_PART_SIZE);
        assert_eq!(part % MIB, 0);
        assert!((size as u64).div_ceil(part) <= MAX_PARTS);
    }

    #[test]
    fn coordinates_require_bucket_and_object() {
        let missing = InitUploadResponse::default();
        assert!(coordinates(&missing).is_err());

        let ok = InitUploadResponse {
            bucket: Some("b".to_string()),
            object: Some("o".to_string()),
            ..Default::default()
        };
        assert_eq!(coordinates(&ok).unwrap(), ("b", "o"));
    }
}
