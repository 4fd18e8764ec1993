//! One-shot sample-stream upload.
//!
//! Small objects skip multipart bookkeeping entirely: a policy-signed
//! multipart-form POST carries the bytes in a single request. The file
//! part is streamed through the request body, so the content is never
//! buffered whole.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Body;
use reqwest::multipart::{Form, Part};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::source::SourceFactory;
use super::{SamplePolicy, UploadError, UploadedObject, parse_callback};
use crate::account::AccountingSink;

/// Total request deadline for a sample upload (15 minutes).
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Streams policy-signed form uploads.
#[derive(Debug, Clone)]
pub struct SampleUploader {
    client: reqwest::Client,
}

impl Default for SampleUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleUploader {
    /// Creates an uploader with the standard timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// POSTs `source` to the policy's host as a multipart form and parses
    /// the server's callback body.
    ///
    /// # Errors
    ///
    /// Transport failures, non-2xx responses, callback parse failures, or
    /// [`UploadError::Cancelled`].
    #[instrument(skip_all, fields(host = policy.host, name = file_name))]
    pub async fn upload(
        &self,
        policy: &SamplePolicy,
        source: &dyn SourceFactory,
        file_name: &str,
        sink: Option<Arc<dyn AccountingSink>>,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, UploadError> {
        let reader = source.open(0).await?;
        let stream = ReaderStream::new(CountingReader { inner: reader, sink });

        let size = source.size();
        let file_part = if size >= 0 {
            Part::stream_with_length(Body::wrap_stream(stream), size as u64)
        } else {
            Part::stream(Body::wrap_stream(stream))
        }
        .file_name(file_name.to_string());

        let form = Form::new()
            .text("name", file_name.to_string())
            .text("key", policy.object_key.clone())
            .text("policy", policy.policy.clone())
            .text("OSSAccessKeyId", policy.access_key_id.clone())
            .text("success_action_status", "200")
            .text("callback", policy.callback.clone())
            .text("signature", policy.signature.clone())
            .part("file", file_part);

        debug!("posting sample upload form");
        let request = self.client.post(&policy.host).multipart(form).send();
        let response = tokio::select! {
            response = request => response?,
            () = cancel.cancelled() => return Err(UploadError::Cancelled),
        };

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(UploadError::Api {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| UploadError::Protocol {
                message: format!("sample callback was not JSON: {e}"),
            })?;
        let object = parse_callback(&value)?;
        info!(file_id = %object.file_id, "sample upload complete");
        Ok(object)
    }
}

/// `AsyncRead` wrapper that reports byte counts to the accounting sink as
/// they stream out.
struct CountingReader<R> {
    inner: R,
    sink: Option<Arc<dyn AccountingSink>>,
}

impl<R: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                if let Some(sink) = &self.sink {
                    sink.add_bytes(read as u64);
                }
            }
        }
        poll
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::account::RecordingSink;
    use crate::upload::source::BufferedSource;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy(host: String) -> SamplePolicy {
        SamplePolicy {
            host,
            object_key: "objkey".to_string(),
            policy: "cG9saWN5".to_string(),
            access_key_id: "AKID".to_string(),
            callback: "Y2FsbGJhY2s=".to_string(),
            signature: "sig".to_string(),
        }
    }

    #[tokio::test]
    async fn form_post_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "state": true,
                "data": {"file_id": "55", "pick_code": "pc55", "file_size": 5}
            })))
            .mount(&server)
            .await;

        let uploader = SampleUploader::new();
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"hello"));
        let sink = Arc::new(RecordingSink::new());
        let cancel = CancellationToken::new();

        let object = uploader
            .upload(
                &policy(server.uri()),
                &source,
                "a.bin",
                Some(sink.clone() as Arc<dyn AccountingSink>),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(object.file_id, "55");
        assert_eq!(object.pick_code, "pc55");
        assert_eq!(sink.bytes(), 5);

        // The form fields reached the server.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        for field in ["name", "key", "policy", "OSSAccessKeyId", "success_action_status", "callback", "signature"] {
            assert!(body.contains(field), "missing form field {field}");
        }
        assert!(body.contains("hello"));
    }

    #[tokio::test]
    async fn server_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let uploader = SampleUploader::new();
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"x"));
        let err = uploader
            .upload(
                &policy(server.uri()),
                &source,
                "a.bin",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Api { status: Some(403), .. }));
    }

    #[tokio::test]
    async fn non_json_callback_is_a_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let uploader = SampleUploader::new();
        let source = BufferedSource::from_bytes(bytes::Bytes::from_static(b"x"));
        let err = uploader
            .upload(
                &policy(server.uri()),
                &source,
                "a.bin",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol { .. }));
    }
}
