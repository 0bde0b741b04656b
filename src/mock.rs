//! In-memory stand-ins for devices, the match video, the encoder and the
//! review API
//!
//! Used by the test suites and for running a session headless.

use crate::capture::{
    AudioTrack, MatchVideo, MediaConstraints, MediaError, MediaKind, MediaPlatform,
    MediaSourceDescriptor, MediaTrack, PlatformGrant, Resolution, VideoTrack, MAX_BUFFERED_AUDIO,
};
use crate::compositor::{Rgba, Surface};
use crate::recorder::{
    EncodePrimitive, EncoderParams, EncoderSession, EncodingFormat, ReviewArtifact, SinkError,
};
use crate::submit::{ProgressCallback, ReviewUploader, SubmitError, SubmitProgress, SubmitReceipt};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ============================================================================
// Tracks
// ============================================================================

/// Camera track showing a solid colour
#[derive(Debug)]
pub struct MockVideoTrack {
    id: String,
    source_id: String,
    label: String,
    resolution: Option<Resolution>,
    frame: Option<Arc<Surface>>,
    live: AtomicBool,
}

impl MockVideoTrack {
    pub fn new(source_id: &str, resolution: Resolution, color: Rgba) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            label: format!("Mock camera {}", source_id),
            resolution: Some(resolution),
            frame: Some(Arc::new(Surface::filled(
                resolution.width,
                resolution.height,
                color,
            ))),
            live: AtomicBool::new(true),
        })
    }

    /// A track that never reports its size
    pub fn without_metadata(source_id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            label: format!("Mock camera {}", source_id),
            resolution: None,
            frame: None,
            live: AtomicBool::new(true),
        })
    }

    /// Simulate the device going away
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl MediaTrack for MockVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl VideoTrack for MockVideoTrack {
    fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn latest_frame(&self) -> Option<Arc<Surface>> {
        self.frame.clone()
    }
}

/// How a mock microphone behaves once granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrophoneSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// Time `is_live` takes to answer
    pub liveness_delay: Duration,
}

impl Default for MicrophoneSpec {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            liveness_delay: Duration::ZERO,
        }
    }
}

/// Microphone track producing a 440Hz tone in real time
///
/// Like a device callback it accumulates audio from the moment it is
/// granted, whether or not anyone drains it, keeping at most
/// `MAX_BUFFERED_AUDIO`.
#[derive(Debug)]
pub struct MockAudioTrack {
    id: String,
    source_id: String,
    label: String,
    spec: MicrophoneSpec,
    granted_at: Instant,
    /// Frames handed out or dropped so far
    position: Mutex<u64>,
    drains: Mutex<Vec<usize>>,
    live: AtomicBool,
}

impl MockAudioTrack {
    pub fn new(source_id: &str) -> Arc<Self> {
        Self::with_spec(source_id, MicrophoneSpec::default())
    }

    pub fn with_spec(source_id: &str, spec: MicrophoneSpec) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            label: format!("Mock microphone {}", source_id),
            spec,
            granted_at: Instant::now(),
            position: Mutex::new(0),
            drains: Mutex::new(Vec::new()),
            live: AtomicBool::new(true),
        })
    }

    /// Simulate the device going away
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Frames returned by each `drain_samples` call, in order
    pub fn drained_frames(&self) -> Vec<usize> {
        self.drains.lock().clone()
    }
}

impl MediaTrack for MockAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_live(&self) -> bool {
        if !self.spec.liveness_delay.is_zero() {
            std::thread::sleep(self.spec.liveness_delay);
        }
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl AudioTrack for MockAudioTrack {
    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn channels(&self) -> u16 {
        self.spec.channels
    }

    fn drain_samples(&self) -> Vec<f32> {
        if !self.live.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let rate = u64::from(self.spec.sample_rate);
        let due = (self.granted_at.elapsed().as_nanos() * u128::from(rate) / 1_000_000_000) as u64;
        let capacity = rate * MAX_BUFFERED_AUDIO.as_millis() as u64 / 1000;

        let mut position = self.position.lock();
        let start = (*position).max(due.saturating_sub(capacity));
        *position = due;
        drop(position);

        let frames = (due - start) as usize;
        self.drains.lock().push(frames);

        let channels = usize::from(self.spec.channels.max(1));
        let step = 2.0 * std::f32::consts::PI * 440.0 / self.spec.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames * channels);
        for n in start..due {
            let value = 0.25 * (step * (n % rate) as f32).sin();
            samples.extend(std::iter::repeat(value).take(channels));
        }
        samples
    }
}

// ============================================================================
// Platform
// ============================================================================

struct PlatformState {
    devices: Vec<MediaSourceDescriptor>,
    deny: bool,
    unavailable: HashSet<String>,
    camera_metadata: bool,
    video_tracks: Vec<Arc<MockVideoTrack>>,
    audio_tracks: Vec<Arc<MockAudioTrack>>,
    microphones: HashMap<String, MicrophoneSpec>,
    overlap_violations: usize,
}

/// Media platform with scripted devices
///
/// Clones share state, so a test can keep one and hand another to the code
/// under test.
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl MockPlatform {
    pub fn new(devices: Vec<MediaSourceDescriptor>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlatformState {
                devices,
                deny: false,
                unavailable: HashSet::new(),
                camera_metadata: true,
                video_tracks: Vec::new(),
                audio_tracks: Vec::new(),
                microphones: HashMap::new(),
                overlap_violations: 0,
            })),
        }
    }

    /// Two cameras (`cam-1`, `cam-2`) and one microphone (`mic-1`)
    pub fn with_default_devices() -> Self {
        let device = |id: &str, kind, label: &str| MediaSourceDescriptor {
            id: id.to_string(),
            kind,
            label: label.to_string(),
        };
        Self::new(vec![
            device("cam-1", MediaKind::Video, "Front Camera"),
            device("cam-2", MediaKind::Video, "USB Camera"),
            device("mic-1", MediaKind::Audio, "Built-in Microphone"),
        ])
    }

    pub fn set_deny(&self, deny: bool) {
        self.state.lock().deny = deny;
    }

    pub fn set_unavailable(&self, device_id: &str) {
        self.state.lock().unavailable.insert(device_id.to_string());
    }

    pub fn set_available(&self, device_id: &str) {
        self.state.lock().unavailable.remove(device_id);
    }

    /// When false, granted cameras never report a size
    pub fn set_camera_metadata(&self, known: bool) {
        self.state.lock().camera_metadata = known;
    }

    /// How microphones granted from `device_id` from now on behave
    pub fn set_microphone(&self, device_id: &str, spec: MicrophoneSpec) {
        self.state.lock().microphones.insert(device_id.to_string(), spec);
    }

    pub fn live_video_tracks(&self) -> usize {
        self.state
            .lock()
            .video_tracks
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    pub fn live_audio_tracks(&self) -> usize {
        self.state
            .lock()
            .audio_tracks
            .iter()
            .filter(|t| t.is_live())
            .count()
    }

    /// Requests made while an earlier camera was still held
    pub fn overlap_violations(&self) -> usize {
        self.state.lock().overlap_violations
    }

    /// Most recently granted camera
    pub fn last_video_track(&self) -> Option<Arc<MockVideoTrack>> {
        self.state.lock().video_tracks.last().cloned()
    }

    /// Most recently granted microphone
    pub fn last_audio_track(&self) -> Option<Arc<MockAudioTrack>> {
        self.state.lock().audio_tracks.last().cloned()
    }
}

fn pick_device(
    state: &PlatformState,
    kind: MediaKind,
    requested: Option<&str>,
) -> Result<(usize, MediaSourceDescriptor), MediaError> {
    let mut candidates = state.devices.iter().filter(|d| d.kind == kind).enumerate();
    let found = match requested {
        Some(id) => candidates.find(|(_, d)| d.id == id),
        None => candidates.next(),
    };
    let (index, device) = found.ok_or_else(|| {
        MediaError::DeviceUnavailable(requested.unwrap_or("default device").to_string())
    })?;
    if state.unavailable.contains(&device.id) {
        return Err(MediaError::DeviceUnavailable(format!(
            "{} is in use",
            device.id
        )));
    }
    Ok((index, device.clone()))
}

const CAMERA_COLORS: [Rgba; 3] = [
    Rgba::rgb(220, 40, 40),
    Rgba::rgb(40, 40, 220),
    Rgba::rgb(220, 220, 40),
];

#[async_trait]
impl MediaPlatform for MockPlatform {
    async fn request_access(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<PlatformGrant, MediaError> {
        let mut state = self.state.lock();
        if state.deny {
            return Err(MediaError::AccessDenied("permission denied".to_string()));
        }
        if state.video_tracks.iter().any(|t| t.is_live()) {
            state.overlap_violations += 1;
        }

        let video = match &constraints.video {
            Some(v) => {
                let (index, device) =
                    pick_device(&state, MediaKind::Video, v.device_id.as_deref())?;
                let track = if state.camera_metadata {
                    MockVideoTrack::new(
                        &device.id,
                        v.resolution,
                        CAMERA_COLORS[index % CAMERA_COLORS.len()],
                    )
                } else {
                    MockVideoTrack::without_metadata(&device.id)
                };
                Some(track)
            }
            None => None,
        };
        let audio = match &constraints.audio {
            Some(a) => {
                let (_, device) = pick_device(&state, MediaKind::Audio, a.device_id.as_deref())?;
                let spec = state.microphones.get(&device.id).copied().unwrap_or_default();
                Some(MockAudioTrack::with_spec(&device.id, spec))
            }
            None => None,
        };

        if let Some(track) = &video {
            state.video_tracks.push(Arc::clone(track));
        }
        if let Some(track) = &audio {
            state.audio_tracks.push(Arc::clone(track));
        }

        Ok(PlatformGrant {
            video: video.map(|t| t as Arc<dyn VideoTrack>),
            audio: audio.map(|t| t as Arc<dyn AudioTrack>),
        })
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaSourceDescriptor>, MediaError> {
        Ok(self.state.lock().devices.clone())
    }
}

// ============================================================================
// Match video
// ============================================================================

/// Match video that shows one still frame
pub struct StillMatchVideo {
    resolution: Option<Resolution>,
    frame: Option<Arc<Surface>>,
    paused: AtomicBool,
    plays: AtomicUsize,
}

impl StillMatchVideo {
    pub fn new(resolution: Resolution, color: Rgba) -> Self {
        Self {
            resolution: Some(resolution),
            frame: Some(Arc::new(Surface::filled(
                resolution.width,
                resolution.height,
                color,
            ))),
            paused: AtomicBool::new(true),
            plays: AtomicUsize::new(0),
        }
    }

    /// A video whose metadata has not loaded yet
    pub fn without_metadata(_color: Rgba) -> Self {
        Self {
            resolution: None,
            frame: None,
            paused: AtomicBool::new(true),
            plays: AtomicUsize::new(0),
        }
    }

    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

impl MatchVideo for StillMatchVideo {
    fn native_resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    fn duration(&self) -> Option<Duration> {
        self.resolution.map(|_| Duration::from_secs(90 * 60))
    }

    fn current_frame(&self) -> Option<Arc<Surface>> {
        self.frame.clone()
    }

    fn play(&self) -> Result<(), MediaError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// What a `MockEncoder` has been asked to do
#[derive(Debug, Clone, Default)]
pub struct EncoderLog {
    pub opened: Vec<EncoderParams>,
    pub video_frames: usize,
    pub audio_samples: usize,
    pub finished: usize,
}

/// Encoder that "encodes" each frame as its raw RGBA bytes
///
/// The recorded artifact is the concatenation of every pushed frame, so the
/// last `width * height * 4` bytes are the final frame.
#[derive(Clone)]
pub struct MockEncoder {
    supported: Vec<String>,
    fail_after: Option<usize>,
    log: Arc<Mutex<EncoderLog>>,
}

impl MockEncoder {
    pub fn supporting(mime_types: &[&str]) -> Self {
        Self {
            supported: mime_types.iter().map(|m| m.to_string()).collect(),
            fail_after: None,
            log: Arc::new(Mutex::new(EncoderLog::default())),
        }
    }

    /// Fail on the frame after `frames` frames were accepted
    pub fn failing_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn log(&self) -> EncoderLog {
        self.log.lock().clone()
    }
}

impl EncodePrimitive for MockEncoder {
    fn is_supported(&self, format: &EncodingFormat) -> bool {
        self.supported.iter().any(|m| m == format.mime_type())
    }

    fn open(&self, params: &EncoderParams) -> Result<Box<dyn EncoderSession>, SinkError> {
        if !self.is_supported(&params.format) {
            return Err(SinkError::UnsupportedFormat(params.format.to_string()));
        }
        self.log.lock().opened.push(params.clone());
        Ok(Box::new(MockEncoderSession {
            resolution: params.resolution,
            channels: usize::from(params.channels.max(1)),
            pending: BytesMut::new(),
            frames: 0,
            fail_after: self.fail_after,
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockEncoderSession {
    resolution: Resolution,
    channels: usize,
    pending: BytesMut,
    frames: usize,
    fail_after: Option<usize>,
    log: Arc<Mutex<EncoderLog>>,
}

impl EncoderSession for MockEncoderSession {
    fn push_video(&mut self, frame: &Surface) -> Result<(), SinkError> {
        if self.fail_after.is_some_and(|limit| self.frames >= limit) {
            return Err(SinkError::Encoder("injected failure".to_string()));
        }
        if frame.resolution() != self.resolution {
            return Err(SinkError::Encoder(format!(
                "frame is {}, expected {}",
                frame.resolution(),
                self.resolution
            )));
        }
        self.pending.extend_from_slice(frame.data());
        self.frames += 1;
        self.log.lock().video_frames += 1;
        Ok(())
    }

    fn push_audio(&mut self, samples: &[f32]) -> Result<(), SinkError> {
        if samples.len() % self.channels != 0 {
            return Err(SinkError::Encoder(format!(
                "{} samples do not fill {} channels",
                samples.len(),
                self.channels
            )));
        }
        self.log.lock().audio_samples += samples.len();
        Ok(())
    }

    fn take_chunk(&mut self) -> Result<Option<Bytes>, SinkError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.pending.split().freeze()))
    }

    fn finish(mut self: Box<Self>) -> Result<Option<Bytes>, SinkError> {
        self.log.lock().finished += 1;
        self.take_chunk()
    }
}

// ============================================================================
// Uploader
// ============================================================================

/// One call made to a `MockUploader`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCall {
    pub atelier_id: String,
    pub artifact_id: Uuid,
    pub bytes: usize,
    pub mime_type: String,
}

/// Uploader returning scripted results, then 200s
#[derive(Clone, Default)]
pub struct MockUploader {
    results: Arc<Mutex<VecDeque<Result<SubmitReceipt, SubmitError>>>>,
    calls: Arc<Mutex<Vec<UploadCall>>>,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: Result<SubmitReceipt, SubmitError>) {
        self.results.lock().push_back(result);
    }

    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ReviewUploader for MockUploader {
    async fn submit(
        &self,
        atelier_id: &str,
        artifact: &ReviewArtifact,
        progress: ProgressCallback,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.calls.lock().push(UploadCall {
            atelier_id: atelier_id.to_string(),
            artifact_id: artifact.id(),
            bytes: artifact.len(),
            mime_type: artifact.mime_type().to_string(),
        });

        let total = artifact.len() as u64;
        progress(SubmitProgress::encoding(total));
        progress(SubmitProgress::uploading(total, total));

        let result = self.results.lock().pop_front().unwrap_or(Ok(SubmitReceipt {
            status: 200,
            bytes_sent: total,
        }));
        if result.is_ok() {
            progress(SubmitProgress::complete(total));
        }
        result
    }
}
