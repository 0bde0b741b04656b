//! Capture trait definitions
//!
//! Platform-agnostic descriptors, constraints and track traits for the
//! camera, microphone and match video sources.

use crate::compositor::Surface;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while acquiring or switching media sources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    AccessDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device enumeration failed: {0}")]
    EnumerationError(String),

    #[error("Source switch failed: {0}")]
    SwitchFailed(String),

    #[error("No active media stream")]
    NoActiveStream,

    #[error("Match video error: {0}")]
    Source(String),
}

/// Kind of hardware input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// An enumerated hardware input
///
/// Labels are only populated once access has been granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSourceDescriptor {
    /// Platform device ID
    pub id: String,

    /// Video or audio
    pub kind: MediaKind,

    /// Human-readable device name
    pub label: String,
}

/// Enumerated sources split by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceList {
    pub video_sources: Vec<MediaSourceDescriptor>,
    pub audio_sources: Vec<MediaSourceDescriptor>,
}

impl SourceList {
    /// Split a flat device list into video and audio sources
    pub fn from_devices(devices: Vec<MediaSourceDescriptor>) -> Self {
        let (video_sources, audio_sources) = devices
            .into_iter()
            .partition(|d| d.kind == MediaKind::Video);
        Self {
            video_sources,
            audio_sources,
        }
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Self = Self::new(640, 480);
    pub const HD: Self = Self::new(1280, 720);
    pub const FULL_HD: Self = Self::new(1920, 1080);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Requested camera settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    /// Device to open (None = platform default)
    pub device_id: Option<String>,
    pub resolution: Resolution,
    pub frame_rate: u32,
}

/// Requested microphone settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConstraints {
    /// Device to open (None = platform default)
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Constraints handed to the platform when requesting access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints {
                device_id: None,
                resolution: Resolution::HD,
                frame_rate: 30,
            }),
            audio: Some(AudioConstraints::default()),
        }
    }
}

/// A live hardware track
///
/// Tracks hold a device lock until `stop()` is called. Nothing releases
/// them implicitly.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Unique track ID
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn label(&self) -> &str;

    /// ID of the device backing this track
    fn source_id(&self) -> &str;

    fn is_live(&self) -> bool;

    /// Release the device. Stopping twice is a no-op.
    fn stop(&self);
}

/// Camera track delivering RGBA frames
pub trait VideoTrack: MediaTrack {
    /// Negotiated frame size, None until the first frame's metadata is known
    fn resolution(&self) -> Option<Resolution>;

    /// Most recent frame, if any
    fn latest_frame(&self) -> Option<Arc<Surface>>;
}

/// Microphone track delivering interleaved f32 PCM
pub trait AudioTrack: MediaTrack {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Take the samples captured since the previous call
    ///
    /// At most `MAX_BUFFERED_AUDIO` is held between calls; older samples
    /// are dropped.
    fn drain_samples(&self) -> Vec<f32>;
}

/// Tracks returned by a successful access request
#[derive(Debug, Clone, Default)]
pub struct PlatformGrant {
    pub video: Option<Arc<dyn VideoTrack>>,
    pub audio: Option<Arc<dyn AudioTrack>>,
}

impl PlatformGrant {
    /// Stop every track in the grant
    pub fn stop_all(&self) {
        if let Some(video) = &self.video {
            video.stop();
        }
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }
}

/// Device access provided by the host platform
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    /// Open the devices described by `constraints`
    async fn request_access(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<PlatformGrant, MediaError>;

    /// List every input the platform knows about
    async fn enumerate_devices(&self) -> Result<Vec<MediaSourceDescriptor>, MediaError>;
}
