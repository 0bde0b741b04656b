//! Submission pipeline
//!
//! Delivers a finished artifact to the review API.

pub mod client;
pub mod types;

pub use client::{encode_artifact, HttpReviewUploader, ProgressCallback, ReviewUploader};
pub use types::{ApiConfig, SubmitError, SubmitProgress, SubmitReceipt, SubmitStage};
