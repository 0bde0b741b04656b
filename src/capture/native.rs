//! Native camera and microphone access
//!
//! Cameras are opened with nokhwa on a dedicated capture thread, microphones
//! with cpal on a thread that owns the input stream.

use super::ring::{SampleRing, MAX_BUFFERED_AUDIO};
use super::traits::{
    AudioConstraints, AudioTrack, MediaConstraints, MediaError, MediaKind, MediaPlatform,
    MediaSourceDescriptor, MediaTrack, PlatformGrant, Resolution, VideoConstraints, VideoTrack,
};
use crate::compositor::Surface;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
};
use nokhwa::Camera;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use uuid::Uuid;

fn camera_index(device_id: Option<&str>) -> CameraIndex {
    match device_id {
        Some(id) => match id.parse::<u32>() {
            Ok(idx) => CameraIndex::Index(idx),
            Err(_) => CameraIndex::String(id.to_string()),
        },
        None => CameraIndex::Index(0),
    }
}

/// Camera track backed by a nokhwa capture thread
pub struct NativeVideoTrack {
    id: String,
    label: String,
    source_id: String,
    resolution: RwLock<Option<Resolution>>,
    frame: Arc<RwLock<Option<Arc<Surface>>>>,
    live: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NativeVideoTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeVideoTrack")
            .field("id", &self.id)
            .field("source_id", &self.source_id)
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish()
    }
}

impl NativeVideoTrack {
    async fn open(constraints: &VideoConstraints) -> Result<Arc<Self>, MediaError> {
        let index = camera_index(constraints.device_id.as_deref());
        let source_id = index.to_string();
        let requested = constraints.resolution;
        let fps = constraints.frame_rate;

        let frame = Arc::new(RwLock::new(None));
        let live = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(Resolution, String), MediaError>>();

        let thread_frame = Arc::clone(&frame);
        let thread_live = Arc::clone(&live);
        let handle = std::thread::spawn(move || {
            let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::Closest(
                CameraFormat::new(
                    nokhwa::utils::Resolution::new(requested.width, requested.height),
                    FrameFormat::MJPEG,
                    fps,
                ),
            ));

            let mut camera = match Camera::new(index.clone(), format) {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(format!(
                        "camera {}: {}",
                        index, e
                    ))));
                    return;
                }
            };

            if let Err(e) = camera.open_stream() {
                let _ = ready_tx.send(Err(MediaError::AccessDenied(format!(
                    "camera stream: {}",
                    e
                ))));
                return;
            }

            let actual = camera.camera_format().resolution();
            let resolution = Resolution::new(actual.width(), actual.height());
            let label = camera.info().human_name();
            let _ = ready_tx.send(Ok((resolution, label)));

            while thread_live.load(Ordering::SeqCst) {
                let decoded = camera
                    .frame()
                    .and_then(|buffer| buffer.decode_image::<RgbAFormat>());
                match decoded {
                    Ok(image) => {
                        let (w, h) = (image.width(), image.height());
                        match Surface::from_rgba(w, h, image.into_raw()) {
                            Ok(surface) => *thread_frame.write() = Some(Arc::new(surface)),
                            Err(e) => tracing::warn!("Dropping camera frame: {}", e),
                        }
                    }
                    Err(e) => {
                        tracing::error!("Camera capture failed: {}", e);
                        thread_live.store(false, Ordering::SeqCst);
                    }
                }
            }

            let _ = camera.stop_stream();
            tracing::debug!("Camera thread exited");
        });

        let (resolution, label) = match ready_rx.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MediaError::DeviceUnavailable(
                    "camera thread exited before opening".to_string(),
                ))
            }
        };

        tracing::info!(
            "Camera opened: {} at {} (requested {} @ {}fps)",
            label,
            resolution,
            requested,
            fps
        );

        Ok(Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            label,
            source_id,
            resolution: RwLock::new(Some(resolution)),
            frame,
            live,
            thread: Mutex::new(Some(handle)),
        }))
    }
}

impl MediaTrack for NativeVideoTrack {
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
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl VideoTrack for NativeVideoTrack {
    fn resolution(&self) -> Option<Resolution> {
        *self.resolution.read()
    }

    fn latest_frame(&self) -> Option<Arc<Surface>> {
        self.frame.read().clone()
    }
}

/// Microphone track backed by a cpal input stream
pub struct NativeAudioTrack {
    id: String,
    label: String,
    sample_rate: u32,
    channels: u16,
    samples: Arc<Mutex<SampleRing>>,
    live: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NativeAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeAudioTrack")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish()
    }
}

impl NativeAudioTrack {
    async fn open(constraints: &AudioConstraints) -> Result<Arc<Self>, MediaError> {
        let device_id = constraints.device_id.clone();
        let samples = Arc::new(Mutex::new(SampleRing::with_capacity(1)));
        let live = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(String, u32, u16), MediaError>>();

        if constraints.echo_cancellation || constraints.noise_suppression {
            tracing::debug!(
                "Echo cancellation={} noise suppression={} are left to the OS input chain",
                constraints.echo_cancellation,
                constraints.noise_suppression
            );
        }

        let thread_samples = Arc::clone(&samples);
        let thread_live = Arc::clone(&live);
        let handle = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match &device_id {
                Some(id) => host
                    .input_devices()
                    .ok()
                    .and_then(|mut devices| devices.find(|d| d.name().ok().as_deref() == Some(id))),
                None => host.default_input_device(),
            };
            let Some(device) = device else {
                let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(format!(
                    "microphone {:?} not found",
                    device_id
                ))));
                return;
            };

            let label = device.name().unwrap_or_else(|_| "Microphone".to_string());
            let config = match device.default_input_config() {
                Ok(c) if c.sample_format() == cpal::SampleFormat::F32 => c,
                Ok(c) => {
                    let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(format!(
                        "unsupported sample format {:?}",
                        c.sample_format()
                    ))));
                    return;
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(MediaError::AccessDenied(e.to_string())));
                    return;
                }
            };

            let sample_rate = config.sample_rate().0;
            let channels = config.channels();
            *thread_samples.lock() =
                SampleRing::for_window(sample_rate, channels, MAX_BUFFERED_AUDIO);
            let sink = Arc::clone(&thread_samples);
            let error_live = Arc::clone(&thread_live);
            let stream = device.build_input_stream(
                &config.config(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    sink.lock().push(data);
                },
                move |err| {
                    tracing::error!("Microphone stream error: {}", err);
                    error_live.store(false, Ordering::SeqCst);
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(e.to_string())));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(e.to_string())));
                return;
            }

            let _ = ready_tx.send(Ok((label, sample_rate, channels)));

            while thread_live.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            drop(stream);
            tracing::debug!("Microphone thread exited");
        });

        let (label, sample_rate, channels) = match ready_rx.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MediaError::DeviceUnavailable(
                    "microphone thread exited before opening".to_string(),
                ))
            }
        };

        tracing::info!(
            "Microphone opened: {} ({}Hz, {} channels)",
            label,
            sample_rate,
            channels
        );

        Ok(Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            label,
            sample_rate,
            channels,
            samples,
            live,
            thread: Mutex::new(Some(handle)),
        }))
    }
}

impl MediaTrack for NativeAudioTrack {
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
        &self.label
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl AudioTrack for NativeAudioTrack {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn drain_samples(&self) -> Vec<f32> {
        self.samples.lock().drain()
    }
}

/// Host camera and microphone access
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePlatform;

#[async_trait]
impl MediaPlatform for NativePlatform {
    async fn request_access(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<PlatformGrant, MediaError> {
        let video = match &constraints.video {
            Some(v) => Some(NativeVideoTrack::open(v).await? as Arc<dyn VideoTrack>),
            None => None,
        };

        let audio = match &constraints.audio {
            Some(a) => match NativeAudioTrack::open(a).await {
                Ok(track) => Some(track as Arc<dyn AudioTrack>),
                Err(e) => {
                    // Don't hold the camera when the grant as a whole failed
                    if let Some(video) = &video {
                        video.stop();
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(PlatformGrant { video, audio })
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaSourceDescriptor>, MediaError> {
        let mut devices: Vec<MediaSourceDescriptor> = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| MediaError::EnumerationError(e.to_string()))?
            .into_iter()
            .map(|info| MediaSourceDescriptor {
                id: info.index().to_string(),
                kind: MediaKind::Video,
                label: info.human_name(),
            })
            .collect();

        let host = cpal::default_host();
        let inputs = host
            .input_devices()
            .map_err(|e| MediaError::EnumerationError(e.to_string()))?;
        for device in inputs {
            match device.name() {
                Ok(name) => devices.push(MediaSourceDescriptor {
                    id: name.clone(),
                    kind: MediaKind::Audio,
                    label: name,
                }),
                Err(e) => tracing::warn!("Skipping unnamed input device: {}", e),
            }
        }

        Ok(devices)
    }
}
