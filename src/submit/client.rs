//! Review upload client
//!
//! POST /ateliers/{id}/review as multipart with `encodedVideoBlob` (base64
//! of the artifact) and `mimeType`.

use super::types::{ApiConfig, SubmitError, SubmitProgress, SubmitReceipt};
use crate::recorder::ReviewArtifact;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream;
use reqwest::multipart::{Form, Part};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type ProgressCallback = Arc<dyn Fn(SubmitProgress) + Send + Sync>;

/// Something that can deliver a finished review
#[async_trait]
pub trait ReviewUploader: Send + Sync {
    async fn submit(
        &self,
        atelier_id: &str,
        artifact: &ReviewArtifact,
        progress: ProgressCallback,
    ) -> Result<SubmitReceipt, SubmitError>;
}

/// Transfer encoding of the artifact body
pub fn encode_artifact(artifact: &ReviewArtifact) -> String {
    STANDARD.encode(artifact.data())
}

/// Split `data` into pieces of at most `size` bytes without copying
fn split_body(data: Bytes, size: usize) -> Vec<Bytes> {
    let size = size.max(1);
    (0..data.len())
        .step_by(size)
        .map(|start| data.slice(start..(start + size).min(data.len())))
        .collect()
}

pub struct HttpReviewUploader {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpReviewUploader {
    pub fn new(config: ApiConfig) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("atelier-review/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SubmitError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn review_url(&self, atelier_id: &str) -> String {
        format!(
            "{}/ateliers/{}/review",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(atelier_id)
        )
    }
}

fn classify(e: reqwest::Error) -> SubmitError {
    if e.is_builder() {
        SubmitError::Client(e.to_string())
    } else {
        SubmitError::Network(e.to_string())
    }
}

#[async_trait]
impl ReviewUploader for HttpReviewUploader {
    async fn submit(
        &self,
        atelier_id: &str,
        artifact: &ReviewArtifact,
        progress: ProgressCallback,
    ) -> Result<SubmitReceipt, SubmitError> {
        progress(SubmitProgress::encoding(artifact.len() as u64));
        let encoded = Bytes::from(encode_artifact(artifact).into_bytes());
        let total = encoded.len() as u64;

        let url = self.review_url(atelier_id);
        tracing::info!(
            "Uploading review {} to {} ({} bytes encoded, {})",
            artifact.id(),
            url,
            total,
            artifact.mime_type()
        );

        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let body_progress = Arc::clone(&progress);
        let pieces = split_body(encoded, self.config.upload_chunk_bytes);
        let body = stream::iter(pieces.into_iter().map(move |piece| {
            let so_far = counter.fetch_add(piece.len() as u64, Ordering::SeqCst) + piece.len() as u64;
            body_progress(SubmitProgress::uploading(so_far, total));
            Ok::<Bytes, std::io::Error>(piece)
        }));

        let form = Form::new()
            .part(
                "encodedVideoBlob",
                Part::stream_with_length(reqwest::Body::wrap_stream(body), total),
            )
            .text("mimeType", artifact.mime_type().to_string());

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(classify)?;
        progress(SubmitProgress::waiting(total));

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(512);
            tracing::warn!("Review upload rejected: {} {}", status, message);
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        progress(SubmitProgress::complete(total));
        tracing::info!("Review upload accepted ({})", status);
        Ok(SubmitReceipt {
            status: status.as_u16(),
            bytes_sent: sent.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{EncodingFormat, RecordedChunks};
    use crate::submit::SubmitStage;

    #[test]
    fn test_review_url_escapes_id() {
        let uploader = HttpReviewUploader::new(ApiConfig {
            base_url: "https://api.test/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            uploader.review_url("a b/c"),
            "https://api.test/ateliers/a%20b%2Fc/review"
        );
    }

    #[test]
    fn test_encode_artifact_base64() {
        let mut chunks = RecordedChunks::new();
        chunks.push(Bytes::from_static(b"hello"));
        let artifact = chunks.into_artifact(EncodingFormat::new("video/webm"));
        assert_eq!(encode_artifact(&artifact), "aGVsbG8=");
    }

    /// Serve one request with `status` and hand back the raw request
    async fn respond_once(status: &'static str) -> (String, tokio::sync::oneshot::Receiver<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let done = request.windows(4).any(|w| w == b"\r\n\r\n")
                    && (request.ends_with(b"--\r\n") || request.ends_with(b"0\r\n\r\n"));
                if done {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (base_url, rx)
    }

    fn artifact() -> ReviewArtifact {
        let mut chunks = RecordedChunks::new();
        chunks.push(Bytes::from_static(b"webm-bytes"));
        chunks.into_artifact(EncodingFormat::new("video/webm;codecs=vp9,opus"))
    }

    #[tokio::test]
    async fn test_submit_posts_multipart() {
        let (base_url, request) = respond_once("200 OK").await;
        let uploader = HttpReviewUploader::new(ApiConfig {
            base_url,
            upload_chunk_bytes: 4,
            ..Default::default()
        })
        .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receipt = uploader
            .submit("42", &artifact(), Arc::new(move |p: SubmitProgress| sink.lock().push(p)))
            .await
            .unwrap();

        assert_eq!(receipt.status, 200);
        assert_eq!(receipt.bytes_sent, STANDARD.encode(b"webm-bytes").len() as u64);

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /ateliers/42/review HTTP/1.1"));
        assert!(request.contains("multipart/form-data"));
        assert!(request.contains("name=\"encodedVideoBlob\""));
        assert!(request.contains(&STANDARD.encode(b"webm-bytes")));
        assert!(request.contains("name=\"mimeType\""));
        assert!(request.contains("video/webm;codecs=vp9,opus"));

        let seen = seen.lock();
        assert_eq!(seen.first().map(|p| p.stage), Some(SubmitStage::Encoding));
        assert_eq!(seen.last().map(|p| p.stage), Some(SubmitStage::Complete));
        assert!(seen.iter().any(|p| p.stage == SubmitStage::Uploading));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (base_url, _request) = respond_once("503 Service Unavailable").await;
        let uploader = HttpReviewUploader::new(ApiConfig {
            base_url,
            ..Default::default()
        })
        .unwrap();

        let err = uploader
            .submit("42", &artifact(), Arc::new(|_: SubmitProgress| {}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::Rejected {
                status: 503,
                message: "body".to_string()
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let uploader = HttpReviewUploader::new(ApiConfig {
            base_url,
            ..Default::default()
        })
        .unwrap();
        let err = uploader
            .submit("42", &artifact(), Arc::new(|_: SubmitProgress| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Network(_)));
    }

    #[test]
    fn test_split_body() {
        let pieces = split_body(Bytes::from_static(b"abcdefg"), 3);
        let lens: Vec<usize> = pieces.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![3, 3, 1]);
        assert!(split_body(Bytes::new(), 3).is_empty());
    }
}
