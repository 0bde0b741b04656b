//! Atelier Review - narrated match reviews.
//!
//! A reviewer watches a match video, talks over it on camera and draws on
//! it. This crate composites the three layers once per refresh, encodes the
//! result with the microphone, and uploads the finished review.

pub mod capture;
pub mod compositor;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod overlay;
pub mod recorder;
pub mod submit;
pub mod utils;

pub use capture::{MediaSourceManager, Resolution, SwitchRequest};
pub use compositor::{LayoutSnapshot, Rect, Rgba, SharedLayout};
pub use overlay::{DrawingOverlay, StrokePoint};
pub use recorder::{
    ReviewArtifact, ReviewConfig, ReviewSession, SessionCollaborators, SessionEvent,
    SessionEventKind, SessionPhase, SessionStatus,
};
pub use submit::{ApiConfig, HttpReviewUploader};
pub use utils::{AppError, AppResult, ErrorResponse};

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_review=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Session backed by real devices, ffmpeg and the HTTP review API
#[cfg(feature = "native-devices")]
pub fn open_native_session(
    atelier_id: &str,
    config: ReviewConfig,
    match_video: &Path,
    layout: SharedLayout,
) -> AppResult<ReviewSession> {
    open_session(
        atelier_id,
        config,
        Arc::new(capture::NativePlatform),
        match_video,
        layout,
    )
}

/// Session with real ffmpeg and HTTP upload over a caller-provided platform
pub fn open_session(
    atelier_id: &str,
    config: ReviewConfig,
    platform: Arc<dyn capture::MediaPlatform>,
    match_video: &Path,
    layout: SharedLayout,
) -> AppResult<ReviewSession> {
    tracing::info!(
        "Opening review session v{} for {}",
        env!("CARGO_PKG_VERSION"),
        match_video.display()
    );
    let uploader = HttpReviewUploader::new(config.api.clone())?;
    let collaborators = SessionCollaborators {
        platform,
        match_video: Arc::new(capture::FileMatchVideo::open(match_video)?),
        layout: Arc::new(layout),
        encoder: Arc::new(recorder::FfmpegEncoder::new()),
        uploader: Arc::new(uploader),
    };
    ReviewSession::new(atelier_id, config, collaborators)
}
