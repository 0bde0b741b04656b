//! Media source manager
//!
//! Owns the single active camera/microphone stream. Tracks are published to
//! the compositor and the sink through `TrackSlot`s, which are emptied before
//! any track is stopped so readers never see a released device.

use super::traits::{
    AudioConstraints, AudioTrack, MediaConstraints, MediaError, MediaPlatform, MediaTrack,
    PlatformGrant, Resolution, SourceList, VideoConstraints, VideoTrack,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

struct SlotState<T: ?Sized> {
    track: Option<Arc<T>>,
    generation: u64,
}

/// Shared reference to the current track of one kind
///
/// Every replacement bumps the generation, so readers can tell when the
/// track they hold has gone stale.
pub struct TrackSlot<T: ?Sized> {
    inner: Arc<RwLock<SlotState<T>>>,
}

impl<T: ?Sized> Clone for TrackSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for TrackSlot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SlotState {
                track: None,
                generation: 0,
            })),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for TrackSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.read();
        f.debug_struct("TrackSlot")
            .field("occupied", &state.track.is_some())
            .field("generation", &state.generation)
            .finish()
    }
}

impl<T: ?Sized> TrackSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<T>> {
        self.inner.read().track.clone()
    }

    /// Current track together with its generation
    pub fn subscribe(&self) -> (u64, Option<Arc<T>>) {
        let state = self.inner.read();
        (state.generation, state.track.clone())
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// True while no replacement happened since `generation` was observed
    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.read().generation == generation
    }

    pub(crate) fn replace(&self, track: Option<Arc<T>>) {
        let mut state = self.inner.write();
        state.track = track;
        state.generation += 1;
    }

    pub(crate) fn invalidate(&self) {
        self.replace(None);
    }
}

pub type CameraSlot = TrackSlot<dyn VideoTrack>;
pub type MicrophoneSlot = TrackSlot<dyn AudioTrack>;

/// The one live stream
#[derive(Debug)]
pub struct ActiveStream {
    pub id: Uuid,
    pub video: Option<Arc<dyn VideoTrack>>,
    pub audio: Option<Arc<dyn AudioTrack>>,
    pub constraints: MediaConstraints,
    pub granted_at: DateTime<Utc>,
}

impl ActiveStream {
    fn stop(&self) {
        if let Some(video) = &self.video {
            video.stop();
        }
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.video.as_ref().map(|t| t.is_live()).unwrap_or(true)
            && self.audio.as_ref().map(|t| t.is_live()).unwrap_or(true)
    }
}

/// Result of a successful access request or switch
#[derive(Debug, Clone)]
pub struct MediaGrant {
    pub stream_id: Uuid,
    pub video: Option<Arc<dyn VideoTrack>>,
    pub audio: Option<Arc<dyn AudioTrack>>,
}

/// Arguments to `switch_source`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    /// Camera to open; None keeps the current one
    pub video_source_id: Option<String>,

    /// Microphone to open; None keeps the current one
    pub audio_source_id: Option<String>,

    /// Camera resolution; None keeps the current one
    pub resolution: Option<Resolution>,
}

pub struct MediaSourceManager {
    platform: Arc<dyn MediaPlatform>,
    active: Option<ActiveStream>,
    camera: CameraSlot,
    microphone: MicrophoneSlot,
    /// Constraints of the last successful grant
    last_constraints: Option<MediaConstraints>,
}

impl MediaSourceManager {
    pub fn new(platform: Arc<dyn MediaPlatform>) -> Self {
        Self {
            platform,
            active: None,
            camera: CameraSlot::new(),
            microphone: MicrophoneSlot::new(),
            last_constraints: None,
        }
    }

    pub fn camera_slot(&self) -> CameraSlot {
        self.camera.clone()
    }

    pub fn microphone_slot(&self) -> MicrophoneSlot {
        self.microphone.clone()
    }

    pub fn active(&self) -> Option<&ActiveStream> {
        self.active.as_ref()
    }

    pub fn has_grant(&self) -> bool {
        self.last_constraints.is_some()
    }

    /// Request camera and microphone access
    ///
    /// Any stream already held is released first.
    pub async fn request_access(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<MediaGrant, MediaError> {
        self.release();

        tracing::info!("Requesting media access: {:?}", constraints);
        let grant = self.platform.request_access(&constraints).await.map_err(|e| {
            tracing::warn!("Media access failed: {}", e);
            e
        })?;

        self.install(grant, constraints)
    }

    /// List sources. Labels are only available after a grant.
    pub async fn enumerate_sources(&self) -> Result<SourceList, MediaError> {
        if !self.has_grant() {
            return Err(MediaError::EnumerationError(
                "media access has not been granted".to_string(),
            ));
        }

        let devices = self
            .platform
            .enumerate_devices()
            .await
            .map_err(|e| match e {
                MediaError::EnumerationError(_) => e,
                other => MediaError::EnumerationError(other.to_string()),
            })?;

        let list = SourceList::from_devices(devices);
        tracing::debug!(
            "Enumerated {} video and {} audio sources",
            list.video_sources.len(),
            list.audio_sources.len()
        );
        Ok(list)
    }

    /// Replace the active stream with one opened on other devices
    ///
    /// The old tracks are stopped before the new request is made. A failed
    /// request leaves no active stream behind.
    pub async fn switch_source(&mut self, request: SwitchRequest) -> Result<MediaGrant, MediaError> {
        let base = self
            .active
            .as_ref()
            .map(|a| a.constraints.clone())
            .or_else(|| self.last_constraints.clone())
            .ok_or(MediaError::NoActiveStream)?;

        let constraints = Self::switched_constraints(base, &request);

        tracing::info!(
            "Switching source: video={:?} audio={:?} resolution={:?}",
            request.video_source_id,
            request.audio_source_id,
            request.resolution
        );
        self.release();

        let grant = match self.platform.request_access(&constraints).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::error!("Source switch failed, no stream is active: {}", e);
                return Err(MediaError::SwitchFailed(e.to_string()));
            }
        };

        self.install(grant, constraints)
            .map_err(|e| MediaError::SwitchFailed(e.to_string()))
    }

    fn switched_constraints(base: MediaConstraints, request: &SwitchRequest) -> MediaConstraints {
        let video = base.video.map(|v| VideoConstraints {
            device_id: request.video_source_id.clone().or(v.device_id),
            resolution: request.resolution.unwrap_or(v.resolution),
            frame_rate: v.frame_rate,
        });
        let audio = base.audio.map(|a| AudioConstraints {
            device_id: request.audio_source_id.clone().or(a.device_id),
            ..a
        });
        MediaConstraints { video, audio }
    }

    fn install(
        &mut self,
        grant: PlatformGrant,
        constraints: MediaConstraints,
    ) -> Result<MediaGrant, MediaError> {
        if constraints.video.is_some() && grant.video.is_none() {
            grant.stop_all();
            return Err(MediaError::DeviceUnavailable(
                "no camera track granted".to_string(),
            ));
        }
        if constraints.audio.is_some() && grant.audio.is_none() {
            grant.stop_all();
            return Err(MediaError::DeviceUnavailable(
                "no microphone track granted".to_string(),
            ));
        }

        let stream = ActiveStream {
            id: Uuid::new_v4(),
            video: grant.video,
            audio: grant.audio,
            constraints: constraints.clone(),
            granted_at: Utc::now(),
        };

        self.camera.replace(stream.video.clone());
        self.microphone.replace(stream.audio.clone());

        let result = MediaGrant {
            stream_id: stream.id,
            video: stream.video.clone(),
            audio: stream.audio.clone(),
        };

        tracing::info!(
            "Media granted: stream={} camera={:?} microphone={:?}",
            stream.id,
            stream.video.as_ref().map(|t| t.label().to_string()),
            stream.audio.as_ref().map(|t| t.label().to_string())
        );

        self.active = Some(stream);
        self.last_constraints = Some(constraints);
        Ok(result)
    }

    /// Stop every held track
    pub fn release(&mut self) {
        self.camera.invalidate();
        self.microphone.invalidate();
        if let Some(stream) = self.active.take() {
            tracing::debug!("Releasing stream {}", stream.id);
            stream.stop();
        }
    }
}

impl Drop for MediaSourceManager {
    fn drop(&mut self) {
        self.release();
    }
}
