//! Submission types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upload errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Upload rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl SubmitError {
    /// Transport failures and server-side errors can be retried with the same artifact
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Network(_) => true,
            SubmitError::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            SubmitError::Encoding(_) | SubmitError::Client(_) => false,
        }
    }
}

/// Review API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    /// Base URL of the review API, without trailing slash
    pub base_url: String,

    /// Whole-request timeout
    pub timeout_secs: u64,

    /// Size of the body pieces streamed to the server
    pub upload_chunk_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 120,
            upload_chunk_bytes: 64 * 1024,
        }
    }
}

/// Stage of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStage {
    /// Converting the artifact to its transfer encoding
    Encoding,
    /// Sending the body
    Uploading,
    /// Waiting for the server's answer
    Waiting,
    Complete,
}

/// Upload progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitProgress {
    pub stage: SubmitStage,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl SubmitProgress {
    pub fn encoding(total_bytes: u64) -> Self {
        Self {
            stage: SubmitStage::Encoding,
            bytes_sent: 0,
            total_bytes,
        }
    }

    pub fn uploading(bytes_sent: u64, total_bytes: u64) -> Self {
        Self {
            stage: SubmitStage::Uploading,
            bytes_sent,
            total_bytes,
        }
    }

    pub fn waiting(total_bytes: u64) -> Self {
        Self {
            stage: SubmitStage::Waiting,
            bytes_sent: total_bytes,
            total_bytes,
        }
    }

    pub fn complete(total_bytes: u64) -> Self {
        Self {
            stage: SubmitStage::Complete,
            bytes_sent: total_bytes,
            total_bytes,
        }
    }

    /// Fraction sent, 0.0 to 1.0
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_sent as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Server acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub status: u16,
    pub bytes_sent: u64,
}
