//! Review session
//!
//! The session is the only owner of the phase. Components report failures to
//! it and it decides the transition; nothing else changes the phase.

use super::chunks::{RecordedChunks, ReviewArtifact};
use super::sink::{CaptureSink, EncodePrimitive, SinkError, SinkEvent, SinkHandle, SinkSource};
use super::state::{ReviewConfig, SessionPhase};
use crate::capture::{
    MatchVideo, MediaError, MediaGrant, MediaPlatform, MediaSourceManager, MediaTrack,
    SourceList, SwitchRequest, VideoTrack,
};
use crate::compositor::{
    CompositedFrame, Compositor, CompositorHandle, CompositorInputs, GeometryProvider,
};
use crate::overlay::DrawingOverlay;
use crate::submit::{ReviewUploader, SubmitProgress, SubmitReceipt};
use crate::utils::error::{AppError, AppResult, ErrorResponse};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// External collaborators a session drives
#[derive(Clone)]
pub struct SessionCollaborators {
    pub platform: Arc<dyn MediaPlatform>,
    pub match_video: Arc<dyn MatchVideo>,
    pub layout: Arc<dyn GeometryProvider>,
    pub encoder: Arc<dyn EncodePrimitive>,
    pub uploader: Arc<dyn ReviewUploader>,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEventKind {
    #[serde(rename_all = "camelCase")]
    PhaseChanged { from: SessionPhase, to: SessionPhase },
    #[serde(rename_all = "camelCase")]
    MediaGranted {
        stream_id: Uuid,
        camera: Option<String>,
        microphone: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ChunkRecorded { chunk_count: usize, total_bytes: usize },
    #[serde(rename_all = "camelCase")]
    RecordingComplete {
        artifact_id: Uuid,
        bytes: usize,
        mime_type: String,
    },
    SubmitProgress(SubmitProgress),
    Submitted { status: u16 },
    Error(ErrorResponse),
}

/// Event broadcast to session subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: SessionEventKind,
}

/// Snapshot for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub atelier_id: String,
    pub phase: SessionPhase,
    /// False when no preferred format can be encoded
    pub recording_supported: bool,
    pub requires_reload: bool,
    pub chunk_count: usize,
    pub recorded_bytes: usize,
    pub artifact_bytes: Option<usize>,
    pub drawing: bool,
    pub recording_duration_ms: Option<u64>,
}

/// Resources held on behalf of the session, one writer each
#[derive(Default)]
struct SessionResources {
    compositor: Option<CompositorHandle>,
    sink: Option<SinkHandle>,
    sink_events: Option<mpsc::UnboundedReceiver<SinkEvent>>,
    chunks: RecordedChunks,
    artifact: Option<ReviewArtifact>,
    recording_started: Option<Instant>,
    recording_duration: Option<Duration>,
}

pub struct ReviewSession {
    id: Uuid,
    atelier_id: String,
    config: ReviewConfig,
    phase: Arc<RwLock<SessionPhase>>,
    media: MediaSourceManager,
    match_video: Arc<dyn MatchVideo>,
    layout: Arc<dyn GeometryProvider>,
    overlay: DrawingOverlay,
    sink: CaptureSink,
    uploader: Arc<dyn ReviewUploader>,
    resources: SessionResources,
    recording_supported: bool,
    requires_reload: Option<String>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ReviewSession {
    pub fn new(
        atelier_id: impl Into<String>,
        config: ReviewConfig,
        collaborators: SessionCollaborators,
    ) -> AppResult<Self> {
        config.validate()?;

        let sink = CaptureSink::new(
            collaborators.encoder,
            config.preferred_formats.clone(),
            config.timeslice(),
        );
        let recording_supported = match sink.negotiate() {
            Ok(format) => {
                tracing::debug!("Recording will use {}", format);
                true
            }
            Err(e) => {
                tracing::warn!("Recording disabled: {}", e);
                false
            }
        };

        let (event_tx, _) = broadcast::channel(100);
        let session = Self {
            id: Uuid::new_v4(),
            atelier_id: atelier_id.into(),
            overlay: DrawingOverlay::new(config.overlay_resolution),
            config,
            phase: Arc::new(RwLock::new(SessionPhase::Idle)),
            media: MediaSourceManager::new(collaborators.platform),
            match_video: collaborators.match_video,
            layout: collaborators.layout,
            sink,
            uploader: collaborators.uploader,
            resources: SessionResources::default(),
            recording_supported,
            requires_reload: None,
            event_tx,
        };

        tracing::info!(
            "Review session {} created for atelier {}",
            session.id,
            session.atelier_id
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Drawing handle for the UI
    pub fn overlay(&self) -> DrawingOverlay {
        self.overlay.clone()
    }

    pub fn artifact(&self) -> Option<&ReviewArtifact> {
        self.resources.artifact.as_ref()
    }

    pub fn media(&self) -> &MediaSourceManager {
        &self.media
    }

    /// Most recent composited frame while recording
    pub fn latest_frame(&self) -> Option<CompositedFrame> {
        self.resources.compositor.as_ref().and_then(|c| c.latest())
    }

    /// PNG of the most recent composited frame
    pub fn snapshot_png(&self) -> AppResult<Option<Vec<u8>>> {
        match self.latest_frame() {
            Some(frame) => Ok(Some(frame.surface.encode_png()?)),
            None => Ok(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        let recording_duration = match (self.phase(), self.resources.recording_started) {
            (SessionPhase::Recording, Some(started)) => Some(started.elapsed()),
            _ => self.resources.recording_duration,
        };

        SessionStatus {
            session_id: self.id,
            atelier_id: self.atelier_id.clone(),
            phase: self.phase(),
            recording_supported: self.recording_supported,
            requires_reload: self.requires_reload.is_some(),
            chunk_count: self.resources.chunks.len(),
            recorded_bytes: self.resources.chunks.total_bytes(),
            artifact_bytes: self.resources.artifact.as_ref().map(|a| a.len()),
            drawing: self.overlay.is_drawing(),
            recording_duration_ms: recording_duration.map(|d| d.as_millis() as u64),
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.event_tx.send(SessionEvent {
            session_id: self.id,
            at: Utc::now(),
            kind,
        });
    }

    fn emit_error(&self, error: &AppError) {
        self.emit(SessionEventKind::Error(ErrorResponse::from(error)));
    }

    fn transition(&self, to: SessionPhase) -> AppResult<()> {
        let from = {
            let mut phase = self.phase.write();
            let from = *phase;
            if !from.can_transition_to(to) {
                return Err(AppError::InvalidTransition { from, to });
            }
            *phase = to;
            from
        };
        tracing::info!("Session {}: {} -> {}", self.id, from, to);
        self.emit(SessionEventKind::PhaseChanged { from, to });
        Ok(())
    }

    fn ensure_usable(&self) -> AppResult<()> {
        match &self.requires_reload {
            Some(reason) => Err(AppError::RequiresReload(reason.clone())),
            None => Ok(()),
        }
    }

    fn announce_grant(&self, grant: &MediaGrant) {
        self.emit(SessionEventKind::MediaGranted {
            stream_id: grant.stream_id,
            camera: grant.video.as_ref().map(|t| t.label().to_string()),
            microphone: grant.audio.as_ref().map(|t| t.label().to_string()),
        });
    }

    /// Ask for camera and microphone access
    pub async fn request_media(&mut self) -> AppResult<MediaGrant> {
        self.ensure_usable()?;
        self.transition(SessionPhase::MediaRequested)?;

        match self.media.request_access(self.config.constraints()).await {
            Ok(grant) => {
                self.transition(SessionPhase::MediaGranted)?;
                self.announce_grant(&grant);
                Ok(grant)
            }
            Err(e) => {
                let recoverable = matches!(
                    e,
                    MediaError::AccessDenied(_) | MediaError::DeviceUnavailable(_)
                );
                self.transition(if recoverable {
                    SessionPhase::Idle
                } else {
                    SessionPhase::Failed
                })?;
                let error = AppError::from(e);
                self.emit_error(&error);
                Err(error)
            }
        }
    }

    pub async fn enumerate_sources(&self) -> AppResult<SourceList> {
        Ok(self.media.enumerate_sources().await?)
    }

    /// Reopen the devices with a different camera, microphone or resolution
    ///
    /// Allowed before recording, during recording, and after a failed switch.
    pub async fn switch_source(&mut self, request: SwitchRequest) -> AppResult<MediaGrant> {
        self.ensure_usable()?;

        match self.phase() {
            SessionPhase::Recording => match self.media.switch_source(request).await {
                Ok(grant) => {
                    self.announce_grant(&grant);
                    Ok(grant)
                }
                Err(e) => {
                    let error = AppError::from(e);
                    self.abort_recording();
                    self.transition(SessionPhase::Failed)?;
                    self.emit_error(&error);
                    Err(error)
                }
            },
            SessionPhase::MediaGranted | SessionPhase::Failed if self.media.has_grant() => {
                self.transition(SessionPhase::MediaRequested)?;
                match self.media.switch_source(request).await {
                    Ok(grant) => {
                        self.transition(SessionPhase::MediaGranted)?;
                        self.announce_grant(&grant);
                        Ok(grant)
                    }
                    Err(e) => {
                        self.transition(SessionPhase::Failed)?;
                        let error = AppError::from(e);
                        self.emit_error(&error);
                        Err(error)
                    }
                }
            }
            phase => Err(AppError::InvalidPhase(phase)),
        }
    }

    /// Start compositing and encoding
    ///
    /// Both the match video and the camera must have reported their
    /// dimensions; frames are never composed against unknown geometry.
    pub async fn start_recording(&mut self) -> AppResult<()> {
        self.ensure_usable()?;
        let phase = self.phase();
        if phase != SessionPhase::MediaGranted {
            return Err(AppError::InvalidPhase(phase));
        }
        if !self.match_video.has_metadata() {
            return Err(AppError::MetadataNotLoaded("match video".to_string()));
        }
        let camera = self
            .media
            .camera_slot()
            .current()
            .ok_or(MediaError::NoActiveStream)?;
        let camera_resolution = camera
            .resolution()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| AppError::MetadataNotLoaded(format!("camera {}", camera.label())))?;

        let compositor = Compositor::new(CompositorInputs {
            match_video: Arc::clone(&self.match_video),
            camera: self.media.camera_slot(),
            overlay: self.overlay.clone(),
            layout: Arc::clone(&self.layout),
        })?;
        let native = compositor.native_resolution();

        let started = self.sink.start(
            SinkSource {
                frames: compositor.subscribe(),
                microphone: self.media.microphone_slot(),
                camera: self.media.camera_slot(),
                resolution: native,
                frame_rate: self.config.refresh_hz,
            },
            self.config.bitrate_hint,
        );
        let (sink, sink_events) = match started {
            Ok(started) => started,
            Err(e) => {
                if matches!(e, SinkError::UnsupportedFormat(_)) {
                    self.recording_supported = false;
                }
                let error = AppError::from(e);
                self.emit_error(&error);
                return Err(error);
            }
        };

        if let Err(e) = self.match_video.play() {
            // Dropping the handle discards the encoder
            drop(sink);
            return Err(e.into());
        }

        tracing::info!(
            "Recording {} at {} with camera {} at {}",
            self.id,
            native,
            camera.label(),
            camera_resolution
        );

        self.resources.chunks = RecordedChunks::new();
        self.resources.artifact = None;
        self.resources.recording_duration = None;
        self.resources.recording_started = Some(Instant::now());
        self.resources.sink = Some(sink);
        self.resources.sink_events = Some(sink_events);
        self.resources.compositor = Some(compositor.spawn(self.config.refresh_interval()));

        self.transition(SessionPhase::Recording)
    }

    /// Handle every sink message already queued, without waiting
    pub fn pump(&mut self) -> AppResult<usize> {
        let mut handled = 0;
        loop {
            let Some(rx) = self.resources.sink_events.as_mut() else {
                return Ok(handled);
            };
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(handled),
                Err(mpsc::error::TryRecvError::Disconnected) => SinkEvent::Error(
                    SinkError::StreamInactive("sink ended without stopping".to_string()),
                ),
            };
            self.handle_sink_event(event)?;
            handled += 1;
        }
    }

    /// Wait for the next sink message and handle it
    pub async fn next_sink_event(&mut self) -> AppResult<Option<SinkEvent>> {
        let Some(rx) = self.resources.sink_events.as_mut() else {
            return Ok(None);
        };
        let event = rx.recv().await.unwrap_or_else(|| {
            SinkEvent::Error(SinkError::StreamInactive(
                "sink ended without stopping".to_string(),
            ))
        });
        self.handle_sink_event(event.clone())?;
        Ok(Some(event))
    }

    fn handle_sink_event(&mut self, event: SinkEvent) -> AppResult<()> {
        match event {
            SinkEvent::Started { format } => {
                tracing::debug!("Sink started with {}", format);
                Ok(())
            }
            SinkEvent::DataAvailable(chunk) => {
                self.resources.chunks.push(chunk);
                self.emit(SessionEventKind::ChunkRecorded {
                    chunk_count: self.resources.chunks.len(),
                    total_bytes: self.resources.chunks.total_bytes(),
                });
                Ok(())
            }
            SinkEvent::Stopped { format } => {
                // The only place an artifact is assembled
                let chunks = std::mem::take(&mut self.resources.chunks);
                let artifact = chunks.into_artifact(format);
                self.resources.compositor = None;
                self.resources.sink = None;
                self.resources.sink_events = None;
                self.resources.recording_duration =
                    self.resources.recording_started.take().map(|t| t.elapsed());

                tracing::info!(
                    "Recording complete: artifact {} with {} chunks, {} bytes",
                    artifact.id(),
                    artifact.chunk_count(),
                    artifact.len()
                );
                let event = SessionEventKind::RecordingComplete {
                    artifact_id: artifact.id(),
                    bytes: artifact.len(),
                    mime_type: artifact.mime_type().to_string(),
                };
                self.resources.artifact = Some(artifact);
                self.transition(SessionPhase::RecordingComplete)?;
                self.emit(event);
                Ok(())
            }
            SinkEvent::Error(e) => {
                tracing::error!("Recording aborted: {}", e);
                if matches!(e, SinkError::StreamInactive(_)) {
                    self.requires_reload = Some(e.to_string());
                }
                self.abort_recording();
                if self.phase() == SessionPhase::Recording {
                    self.transition(SessionPhase::Failed)?;
                }
                let error = AppError::from(e);
                self.emit_error(&error);
                Err(error)
            }
        }
    }

    /// Drop everything the recording holds and discard its data
    fn abort_recording(&mut self) {
        if let Some(compositor) = self.resources.compositor.take() {
            compositor.stop();
        }
        self.resources.sink = None;
        self.resources.sink_events = None;
        self.resources.chunks = RecordedChunks::new();
        self.resources.recording_started = None;
        self.match_video.pause();
    }

    /// Stop recording and wait for the artifact
    pub async fn stop_recording(&mut self) -> AppResult<ReviewArtifact> {
        match self.phase() {
            SessionPhase::Recording => {}
            SessionPhase::RecordingComplete | SessionPhase::Submitting | SessionPhase::Done => {
                return Err(SinkError::AlreadyStopped.into())
            }
            phase => return Err(AppError::InvalidPhase(phase)),
        }

        // Compositing stops before the sink so no frame lands after finalize.
        // The handle stays alive until the sink is done; dropping it closes
        // the frame stream.
        if let Some(compositor) = self.resources.compositor.as_mut() {
            compositor.stop();
            let frames = compositor.join().await;
            tracing::debug!("Compositor produced {} frames", frames);
        }

        let stopped = match self.resources.sink.as_ref() {
            Some(sink) => sink.stop(),
            None => Err(SinkError::AlreadyStopped),
        };
        self.match_video.pause();

        if let Err(e) = stopped {
            // The sink ended on its own; its error is already queued
            self.pump()?;
            return Err(e.into());
        }

        while self.phase() == SessionPhase::Recording {
            self.next_sink_event().await?;
        }

        self.resources
            .artifact
            .clone()
            .ok_or_else(|| AppError::InvalidPhase(self.phase()))
    }

    /// Upload the artifact. A failure keeps it for another attempt.
    pub async fn submit(&mut self) -> AppResult<SubmitReceipt> {
        let phase = self.phase();
        if phase != SessionPhase::RecordingComplete {
            return Err(AppError::InvalidPhase(phase));
        }
        let artifact = self
            .resources
            .artifact
            .clone()
            .ok_or(AppError::InvalidPhase(phase))?;

        self.transition(SessionPhase::Submitting)?;

        let events = self.event_tx.clone();
        let session_id = self.id;
        let progress = Arc::new(move |p: SubmitProgress| {
            let _ = events.send(SessionEvent {
                session_id,
                at: Utc::now(),
                kind: SessionEventKind::SubmitProgress(p),
            });
        });

        match self
            .uploader
            .submit(&self.atelier_id, &artifact, progress)
            .await
        {
            Ok(receipt) => {
                self.transition(SessionPhase::Done)?;
                self.emit(SessionEventKind::Submitted {
                    status: receipt.status,
                });
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!("Submission failed, artifact kept: {}", e);
                self.transition(SessionPhase::Failed)?;
                let error = AppError::from(e);
                self.emit_error(&error);
                self.transition(SessionPhase::RecordingComplete)?;
                Err(error)
            }
        }
    }

    fn release_resources(&mut self) {
        if let Some(compositor) = self.resources.compositor.take() {
            compositor.stop();
        }
        self.resources = SessionResources::default();
        self.match_video.pause();
        self.overlay.stop_drawing();
        self.media.release();
    }

    /// Release everything, whatever the phase
    pub fn teardown(&mut self) {
        tracing::info!("Tearing down session {} in {}", self.id, self.phase());
        self.release_resources();
        self.requires_reload = None;

        let from = std::mem::replace(&mut *self.phase.write(), SessionPhase::Idle);
        if from != SessionPhase::Idle {
            self.emit(SessionEventKind::PhaseChanged {
                from,
                to: SessionPhase::Idle,
            });
        }
    }
}

impl Drop for ReviewSession {
    fn drop(&mut self) {
        self.release_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Resolution;
    use crate::compositor::{LayoutSnapshot, Rect, Rgba, StaticLayout, Surface};
    use crate::mock::{MicrophoneSpec, MockEncoder, MockPlatform, MockUploader, StillMatchVideo};
    use crate::overlay::StrokePoint;
    use crate::submit::SubmitError;

    const NATIVE: Resolution = Resolution::new(64, 36);
    const PITCH: Rgba = Rgba::rgb(0, 128, 0);
    const CAM_1: Rgba = Rgba::rgb(220, 40, 40);
    const CAM_2: Rgba = Rgba::rgb(40, 40, 220);

    struct Harness {
        session: ReviewSession,
        platform: MockPlatform,
        encoder: MockEncoder,
        uploader: MockUploader,
        video: Arc<StillMatchVideo>,
    }

    fn config() -> ReviewConfig {
        ReviewConfig {
            resolution: Resolution::VGA,
            refresh_hz: 100,
            timeslice_ms: 20,
            overlay_resolution: NATIVE,
            ..Default::default()
        }
    }

    fn harness_with(encoder: MockEncoder, video: StillMatchVideo) -> Harness {
        let platform = MockPlatform::with_default_devices();
        let uploader = MockUploader::new();
        let video = Arc::new(video);
        // Rendered at half size; the camera box lands on (48, 24) natively
        let layout = StaticLayout(LayoutSnapshot {
            match_video_box: Rect::new(0.0, 0.0, 32.0, 18.0),
            camera_box: Some(Rect::new(24.0, 12.0, 8.0, 6.0)),
        });
        let session = ReviewSession::new(
            "atelier-42",
            config(),
            SessionCollaborators {
                platform: Arc::new(platform.clone()),
                match_video: video.clone(),
                layout: Arc::new(layout),
                encoder: Arc::new(encoder.clone()),
                uploader: Arc::new(uploader.clone()),
            },
        )
        .unwrap();
        Harness {
            session,
            platform,
            encoder,
            uploader,
            video,
        }
    }

    fn harness() -> Harness {
        harness_with(
            MockEncoder::supporting(&["video/webm;codecs=vp9,opus"]),
            StillMatchVideo::new(NATIVE, PITCH),
        )
    }

    /// The mock encoder stores raw frames back to back
    fn last_frame(artifact: &ReviewArtifact) -> Surface {
        let frame_len = NATIVE.pixel_count() * 4;
        let data = artifact.data();
        assert!(data.len() >= frame_len, "artifact holds no frame");
        let tail = data.slice(data.len() - frame_len..).to_vec();
        Surface::from_rgba(NATIVE.width, NATIVE.height, tail).unwrap()
    }

    async fn wait_for_error(session: &mut ReviewSession) -> AppError {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match session.next_sink_event().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => panic!("sink went away without an error"),
                    Err(e) => break e,
                }
            }
        })
        .await
        .expect("no sink error within 2s")
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    // ========================================================================
    // Media access
    // ========================================================================

    #[tokio::test]
    async fn test_denied_access_returns_to_idle() {
        let mut h = harness();
        h.platform.set_deny(true);

        let err = h.session.request_media().await.unwrap_err();
        assert_eq!(err.code(), "ACCESS_DENIED");
        assert!(err.is_recoverable());
        assert_eq!(h.session.phase(), SessionPhase::Idle);

        h.platform.set_deny(false);
        h.session.request_media().await.unwrap();
        assert_eq!(h.session.phase(), SessionPhase::MediaGranted);
    }

    #[tokio::test]
    async fn test_enumerate_after_grant() {
        let mut h = harness();
        assert!(h.session.enumerate_sources().await.is_err());

        h.session.request_media().await.unwrap();
        let sources = h.session.enumerate_sources().await.unwrap();
        assert_eq!(sources.video_sources.len(), 2);
        assert_eq!(sources.audio_sources.len(), 1);
    }

    #[tokio::test]
    async fn test_switch_before_recording_uses_new_camera() {
        let mut h = harness();
        h.session.request_media().await.unwrap();

        let grant = h
            .session
            .switch_source(SwitchRequest {
                video_source_id: Some("cam-2".to_string()),
                audio_source_id: None,
                resolution: Some(Resolution::HD),
            })
            .await
            .unwrap();
        assert_eq!(
            grant.video.as_ref().and_then(|v| v.resolution()),
            Some(Resolution::HD)
        );
        assert_eq!(h.session.phase(), SessionPhase::MediaGranted);
        assert_eq!(h.platform.live_video_tracks(), 1);
        assert_eq!(h.platform.overlap_violations(), 0);

        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frame = h.session.latest_frame().unwrap();
        assert!(frame.camera_drawn);
        assert_eq!(frame.surface.pixel(50, 30), Some(CAM_2));
        let png = h.session.snapshot_png().unwrap().unwrap();
        assert_eq!(&png[1..4], b"PNG");

        h.session.stop_recording().await.unwrap();
        assert_eq!(h.encoder.log().opened[0].resolution, NATIVE);
    }

    #[tokio::test]
    async fn test_failed_switch_needs_explicit_retry() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.platform.set_unavailable("cam-2");

        let err = h
            .session
            .switch_source(SwitchRequest {
                video_source_id: Some("cam-2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SWITCH_FAILED");
        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert_eq!(h.platform.live_video_tracks(), 0);

        h.session
            .switch_source(SwitchRequest {
                video_source_id: Some("cam-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.session.phase(), SessionPhase::MediaGranted);
    }

    // ========================================================================
    // Recording
    // ========================================================================

    #[tokio::test]
    async fn test_start_requires_phase_and_metadata() {
        let mut h = harness();
        assert!(matches!(
            h.session.start_recording().await,
            Err(AppError::InvalidPhase(SessionPhase::Idle))
        ));

        h.platform.set_camera_metadata(false);
        h.session.request_media().await.unwrap();
        assert!(matches!(
            h.session.start_recording().await,
            Err(AppError::MetadataNotLoaded(_))
        ));
        assert_eq!(h.session.phase(), SessionPhase::MediaGranted);
        assert!(h.encoder.log().opened.is_empty());
    }

    #[tokio::test]
    async fn test_start_waits_for_match_video_metadata() {
        let mut h = harness_with(
            MockEncoder::supporting(&["video/webm;codecs=vp9,opus"]),
            StillMatchVideo::without_metadata(PITCH),
        );
        h.session.request_media().await.unwrap();

        let err = h.session.start_recording().await.unwrap_err();
        assert!(matches!(err, AppError::MetadataNotLoaded(_)));
        assert!(h.video.is_paused());
    }

    #[tokio::test]
    async fn test_unsupported_codec_disables_recording() {
        let mut h = harness_with(
            MockEncoder::supporting(&[]),
            StillMatchVideo::new(NATIVE, PITCH),
        );
        assert!(!h.session.status().recording_supported);

        h.session.request_media().await.unwrap();
        let err = h.session.start_recording().await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
        assert_eq!(h.session.phase(), SessionPhase::MediaGranted);
    }

    #[tokio::test]
    async fn test_artifact_shows_only_strokes_after_clear() {
        let mut h = harness();
        let overlay = h.session.overlay();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        assert_eq!(h.video.play_count(), 1);

        overlay.start_drawing();
        let line = |y: f32| vec![StrokePoint::new(2.0, y), StrokePoint::new(20.0, y)];
        overlay.add_stroke(line(4.0), Rgba::WHITE, 2.0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        overlay.add_stroke(line(10.0), Rgba::WHITE, 2.0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        overlay.clear();
        overlay
            .add_stroke(line(20.0), Rgba::rgb(255, 255, 0), 2.0)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let artifact = h.session.stop_recording().await.unwrap();
        assert_eq!(h.session.phase(), SessionPhase::RecordingComplete);
        assert_eq!(artifact.mime_type(), "video/webm;codecs=vp9,opus");
        assert!(h.video.is_paused());

        let frame = last_frame(&artifact);
        assert_eq!(frame.pixel(10, 4), Some(PITCH));
        assert_eq!(frame.pixel(10, 10), Some(PITCH));
        assert_eq!(frame.pixel(10, 20), Some(Rgba::rgb(255, 255, 0)));
        assert_eq!(frame.pixel(50, 30), Some(CAM_1));
        assert_eq!(h.encoder.log().finished, 1);
    }

    #[tokio::test]
    async fn test_second_stop_fails() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let artifact = h.session.stop_recording().await.unwrap();
        assert!(!artifact.is_empty());
        assert!(matches!(
            h.session.stop_recording().await,
            Err(AppError::Sink(SinkError::AlreadyStopped))
        ));
        assert_eq!(h.session.artifact().map(|a| a.id()), Some(artifact.id()));
    }

    #[tokio::test]
    async fn test_switch_during_recording_keeps_recording() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.session
            .switch_source(SwitchRequest {
                video_source_id: Some("cam-2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.session.pump().unwrap();
        assert_eq!(h.session.phase(), SessionPhase::Recording);

        let artifact = h.session.stop_recording().await.unwrap();
        assert_eq!(last_frame(&artifact).pixel(50, 30), Some(CAM_2));
        assert_eq!(h.platform.live_video_tracks(), 1);
    }

    #[tokio::test]
    async fn test_recorded_audio_starts_with_the_recording() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        // The reviewer takes a while before pressing record
        tokio::time::sleep(Duration::from_millis(250)).await;

        let started = Instant::now();
        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.session.stop_recording().await.unwrap();
        let recorded = started.elapsed();

        let samples = h.encoder.log().audio_samples;
        assert!(samples > 0);
        assert!(
            samples as f64 <= recorded.as_secs_f64() * 48_000.0 + 1.0,
            "{} samples for {:?} of recording",
            samples,
            recorded
        );
    }

    #[tokio::test]
    async fn test_microphone_in_another_format_is_converted() {
        let mut h = harness();
        h.platform.set_microphone(
            "mic-1",
            MicrophoneSpec {
                sample_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        );
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.platform.set_microphone(
            "mic-1",
            MicrophoneSpec {
                sample_rate: 22_050,
                channels: 1,
                ..Default::default()
            },
        );
        h.session
            .switch_source(SwitchRequest {
                audio_source_id: Some("mic-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.session.stop_recording().await.unwrap();

        let log = h.encoder.log();
        assert_eq!(log.opened[0].channels, 2);
        assert_eq!(log.audio_samples % 2, 0);
        assert_eq!(h.session.phase(), SessionPhase::RecordingComplete);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeated_switches_keep_recording() {
        let mut h = harness();
        h.platform.set_microphone(
            "mic-1",
            MicrophoneSpec {
                liveness_delay: Duration::from_millis(8),
                ..Default::default()
            },
        );
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(9)).await;
            h.session
                .switch_source(SwitchRequest {
                    audio_source_id: Some("mic-1".to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
            h.session.pump().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        h.session.pump().unwrap();
        assert_eq!(h.session.phase(), SessionPhase::Recording);

        h.session.stop_recording().await.unwrap();
        assert_eq!(h.platform.live_audio_tracks(), 1);
    }

    #[tokio::test]
    async fn test_failed_switch_during_recording_aborts() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        h.platform.set_unavailable("cam-2");

        let err = h
            .session
            .switch_source(SwitchRequest {
                video_source_id: Some("cam-2".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SWITCH_FAILED");
        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert!(h.session.artifact().is_none());
        assert_eq!(h.session.status().chunk_count, 0);
    }

    #[tokio::test]
    async fn test_ended_camera_fails_session() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.platform.last_video_track().unwrap().end();
        let err = wait_for_error(&mut h.session).await;
        assert_eq!(err.code(), "STREAM_INACTIVE");
        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert!(h.session.artifact().is_none());

        let status = h.session.status();
        assert!(status.requires_reload);
        assert_eq!(status.chunk_count, 0);
        assert!(matches!(
            h.session.request_media().await,
            Err(AppError::RequiresReload(_))
        ));

        h.session.teardown();
        assert_eq!(h.session.phase(), SessionPhase::Idle);
        h.session.request_media().await.unwrap();
    }

    #[tokio::test]
    async fn test_encoder_failure_discards_recording() {
        let mut h = harness_with(
            MockEncoder::supporting(&["video/webm;codecs=vp9,opus"]).failing_after(2),
            StillMatchVideo::new(NATIVE, PITCH),
        );
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();

        let err = wait_for_error(&mut h.session).await;
        assert_eq!(err.code(), "ENCODER_ERROR");
        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert!(!h.session.status().requires_reload);
        assert!(h.session.artifact().is_none());
    }

    // ========================================================================
    // Submission
    // ========================================================================

    async fn recorded() -> (Harness, ReviewArtifact) {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let artifact = h.session.stop_recording().await.unwrap();
        (h, artifact)
    }

    #[tokio::test]
    async fn test_submit_happy_path() {
        let (mut h, artifact) = recorded().await;
        let mut events = h.session.subscribe();

        let receipt = h.session.submit().await.unwrap();
        assert_eq!(receipt.status, 200);
        assert_eq!(h.session.phase(), SessionPhase::Done);

        let calls = h.uploader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].atelier_id, "atelier-42");
        assert_eq!(calls[0].artifact_id, artifact.id());
        assert_eq!(calls[0].mime_type, artifact.mime_type());

        let kinds = drain(&mut events);
        assert!(kinds
            .iter()
            .any(|k| matches!(k, SessionEventKind::SubmitProgress(_))));
        assert!(kinds.contains(&SessionEventKind::PhaseChanged {
            from: SessionPhase::Submitting,
            to: SessionPhase::Done,
        }));
    }

    #[tokio::test]
    async fn test_failed_submit_keeps_artifact() {
        let (mut h, artifact) = recorded().await;
        h.uploader
            .push_result(Err(SubmitError::Network("connection reset".to_string())));

        let err = h.session.submit().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(h.session.phase(), SessionPhase::RecordingComplete);
        assert_eq!(h.session.artifact().map(|a| a.id()), Some(artifact.id()));

        h.session.submit().await.unwrap();
        assert_eq!(h.session.phase(), SessionPhase::Done);
        let calls = h.uploader.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].artifact_id, calls[1].artifact_id);
    }

    #[tokio::test]
    async fn test_submit_requires_artifact() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        assert!(matches!(
            h.session.submit().await,
            Err(AppError::InvalidPhase(SessionPhase::MediaGranted))
        ));
        assert!(h.uploader.calls().is_empty());
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let mut h = harness();
        h.session.request_media().await.unwrap();
        h.session.start_recording().await.unwrap();
        h.session.overlay().start_drawing();

        h.session.teardown();
        assert_eq!(h.session.phase(), SessionPhase::Idle);
        assert_eq!(h.platform.live_video_tracks(), 0);
        assert_eq!(h.platform.live_audio_tracks(), 0);
        assert!(h.video.is_paused());
        assert!(!h.session.status().drawing);
        assert!(h.session.latest_frame().is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_devices() {
        let h = harness();
        let platform = h.platform.clone();
        let mut session = h.session;
        session.request_media().await.unwrap();
        drop(session);
        assert_eq!(platform.live_video_tracks(), 0);
    }
}
