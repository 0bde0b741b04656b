//! Review session state
//!
//! Defines the session phase machine and the session configuration.

use crate::capture::{AudioConstraints, MediaConstraints, Resolution, VideoConstraints};
use crate::recorder::chunks::EncodingFormat;
use crate::submit::ApiConfig;
use crate::utils::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Phase of a review session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    /// Nothing held
    #[default]
    Idle,
    /// Waiting on the platform for camera/microphone access
    MediaRequested,
    /// Devices held, ready to record
    MediaGranted,
    /// Compositing and encoding
    Recording,
    /// An artifact exists and can be submitted
    RecordingComplete,
    /// Upload in flight
    Submitting,
    /// Upload acknowledged
    Done,
    Failed,
}

impl SessionPhase {
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Idle, MediaRequested)
                | (MediaRequested, MediaGranted)
                | (MediaRequested, Idle)
                | (MediaRequested, Failed)
                | (MediaGranted, MediaRequested)
                | (MediaGranted, Recording)
                | (Recording, RecordingComplete)
                | (Recording, Failed)
                | (RecordingComplete, Submitting)
                | (Submitting, Done)
                | (Submitting, Failed)
                | (Failed, MediaRequested)
                | (Failed, RecordingComplete)
        )
    }

    /// True while devices are held
    pub fn holds_media(self) -> bool {
        matches!(self, SessionPhase::MediaGranted | SessionPhase::Recording)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewConfig {
    pub api: ApiConfig,

    /// Requested camera resolution
    pub resolution: Resolution,

    /// Requested camera frame rate
    pub frame_rate: u32,

    pub echo_cancellation: bool,

    pub noise_suppression: bool,

    /// Preferred camera (None = platform default)
    pub video_device_id: Option<String>,

    /// Preferred microphone (None = platform default)
    pub audio_device_id: Option<String>,

    /// Target encoder bitrate in bits per second
    pub bitrate_hint: u32,

    /// Compositing ticks per second
    pub refresh_hz: u32,

    /// How often encoded data is flushed into chunks
    pub timeslice_ms: u64,

    /// Encoding formats in order of preference
    pub preferred_formats: Vec<EncodingFormat>,

    /// Resolution of the drawing overlay
    pub overlay_resolution: Resolution,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            resolution: Resolution::HD,
            frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
            video_device_id: None,
            audio_device_id: None,
            bitrate_hint: 2_500_000,
            refresh_hz: 60,
            timeslice_ms: 1000,
            preferred_formats: EncodingFormat::default_preferences(),
            overlay_resolution: Resolution::HD,
        }
    }
}

impl ReviewConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded review config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.resolution.is_empty() {
            return Err(AppError::Config("camera resolution must be non-zero".into()));
        }
        if self.overlay_resolution.is_empty() {
            return Err(AppError::Config("overlay resolution must be non-zero".into()));
        }
        if self.frame_rate == 0 || self.refresh_hz == 0 {
            return Err(AppError::Config("frame and refresh rates must be non-zero".into()));
        }
        if self.timeslice_ms == 0 {
            return Err(AppError::Config("timeslice must be non-zero".into()));
        }
        if self.bitrate_hint == 0 {
            return Err(AppError::Config("bitrate hint must be non-zero".into()));
        }
        if self.preferred_formats.is_empty() {
            return Err(AppError::Config("no preferred encoding formats".into()));
        }
        if self.api.base_url.is_empty() {
            return Err(AppError::Config("API base URL is empty".into()));
        }
        Ok(())
    }

    /// Constraints for the initial access request
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: Some(VideoConstraints {
                device_id: self.video_device_id.clone(),
                resolution: self.resolution,
                frame_rate: self.frame_rate,
            }),
            audio: Some(AudioConstraints {
                device_id: self.audio_device_id.clone(),
                echo_cancellation: self.echo_cancellation,
                noise_suppression: self.noise_suppression,
            }),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz.max(1) as f64)
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms.max(1))
    }
}
