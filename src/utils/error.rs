//! Error types and handling
//!
//! Component errors are folded into `AppError`, which the review session
//! hands to the UI as an `ErrorResponse`.

use crate::capture::MediaError;
use crate::compositor::CompositeError;
use crate::overlay::OverlayError;
use crate::recorder::{SessionPhase, SinkError};
use crate::submit::SubmitError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("Operation not allowed in phase {0}")]
    InvalidPhase(SessionPhase),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("Media metadata not loaded: {0}")]
    MetadataNotLoaded(String),

    #[error("Session must be reloaded: {0}")]
    RequiresReload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Stable code for the UI
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Media(e) => match e {
                MediaError::AccessDenied(_) => "ACCESS_DENIED",
                MediaError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
                MediaError::EnumerationError(_) => "ENUMERATION_ERROR",
                MediaError::SwitchFailed(_) => "SWITCH_FAILED",
                MediaError::NoActiveStream => "NO_ACTIVE_STREAM",
                MediaError::Source(_) => "MATCH_VIDEO_ERROR",
            },
            AppError::Overlay(_) => "OVERLAY_ERROR",
            AppError::Composite(CompositeError::GeometryUnknown) => "GEOMETRY_UNKNOWN",
            AppError::Composite(_) => "COMPOSITE_ERROR",
            AppError::Sink(e) => match e {
                SinkError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
                SinkError::AlreadyStopped => "ALREADY_STOPPED",
                SinkError::StreamInactive(_) => "STREAM_INACTIVE",
                SinkError::Encoder(_) | SinkError::Io(_) => "ENCODER_ERROR",
            },
            AppError::Submit(SubmitError::Network(_)) => "NETWORK_ERROR",
            AppError::Submit(_) => "SUBMIT_ERROR",
            AppError::InvalidPhase(_) => "INVALID_PHASE",
            AppError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AppError::MetadataNotLoaded(_) => "METADATA_NOT_LOADED",
            AppError::RequiresReload(_) => "REQUIRES_RELOAD",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the user can carry on in the same session
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Media(MediaError::AccessDenied(_))
            | AppError::Media(MediaError::DeviceUnavailable(_))
            | AppError::Media(MediaError::EnumerationError(_)) => true,
            // No rollback; the user has to retry the switch
            AppError::Media(MediaError::SwitchFailed(_)) => false,
            AppError::Media(_) => false,
            AppError::Overlay(_) => true,
            AppError::Composite(CompositeError::GeometryUnknown) => true,
            AppError::Composite(_) => false,
            AppError::Sink(SinkError::AlreadyStopped) => true,
            AppError::Sink(_) => false,
            AppError::Submit(e) => e.is_retryable(),
            AppError::InvalidPhase(_)
            | AppError::InvalidTransition { .. }
            | AppError::MetadataNotLoaded(_) => true,
            AppError::RequiresReload(_) => false,
            AppError::Config(_) | AppError::Io(_) | AppError::Serialization(_) => false,
        }
    }
}

/// Error response for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl From<&AppError> for ErrorResponse {
    fn from(error: &AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(AppError::from(MediaError::AccessDenied("no".into())).is_recoverable());
        assert!(!AppError::from(MediaError::SwitchFailed("busy".into())).is_recoverable());
        assert!(!AppError::from(SinkError::StreamInactive("unplugged".into())).is_recoverable());
        assert!(!AppError::from(SinkError::UnsupportedFormat("all".into())).is_recoverable());
        assert!(AppError::from(SubmitError::Network("timeout".into())).is_recoverable());
    }

    #[test]
    fn test_error_response() {
        let response = ErrorResponse::from(AppError::InvalidPhase(SessionPhase::Idle));
        assert_eq!(response.code, "INVALID_PHASE");
        assert_eq!(response.message, "Operation not allowed in phase Idle");
        assert!(response.recoverable);
    }
}
