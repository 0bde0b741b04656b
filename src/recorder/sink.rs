//! Capture & encode sink
//!
//! Taps the compositor's frame stream and the microphone slot, feeds them to
//! a platform encoder and reports encoded data as messages. The sink keeps
//! no history; the session accumulates `DataAvailable` chunks.

use super::chunks::EncodingFormat;
use super::resample::{PcmConverter, PcmFormat};
use crate::capture::{
    AudioTrack, CameraSlot, MediaTrack, MicrophoneSlot, Resolution, TrackSlot, VideoTrack,
};
use crate::compositor::compositing::FrameReceiver;
use crate::compositor::Surface;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("No supported encoding format among: {0}")]
    UnsupportedFormat(String),

    #[error("Recording already stopped")]
    AlreadyStopped,

    #[error("Stream became inactive: {0}")]
    StreamInactive(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}

/// Parameters for opening an encoder session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    pub format: EncodingFormat,
    pub resolution: Resolution,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Platform encode capability
pub trait EncodePrimitive: Send + Sync {
    fn is_supported(&self, format: &EncodingFormat) -> bool;

    fn open(&self, params: &EncoderParams) -> Result<Box<dyn EncoderSession>, SinkError>;
}

/// One running encode
///
/// `push_*` and `take_chunk` are called from the async runtime and must not
/// block; `finish` runs on a blocking thread.
pub trait EncoderSession: Send {
    fn push_video(&mut self, frame: &Surface) -> Result<(), SinkError>;

    /// Interleaved f32 PCM
    fn push_audio(&mut self, samples: &[f32]) -> Result<(), SinkError>;

    /// Encoded bytes produced since the last call
    fn take_chunk(&mut self) -> Result<Option<Bytes>, SinkError>;

    /// Flush the encoder and return whatever it still held
    fn finish(self: Box<Self>) -> Result<Option<Bytes>, SinkError>;
}

/// Messages from the sink to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Started { format: EncodingFormat },
    DataAvailable(Bytes),
    /// Emitted once, after the last chunk
    Stopped { format: EncodingFormat },
    /// Fatal; no further events follow
    Error(SinkError),
}

/// What the sink records
pub struct SinkSource {
    pub frames: FrameReceiver,
    pub microphone: MicrophoneSlot,
    /// Watched for unexpected loss only; frames come through the compositor
    pub camera: CameraSlot,
    pub resolution: Resolution,
    pub frame_rate: u32,
}

pub struct CaptureSink {
    encoder: Arc<dyn EncodePrimitive>,
    preferences: Vec<EncodingFormat>,
    timeslice: Duration,
}

impl CaptureSink {
    pub fn new(
        encoder: Arc<dyn EncodePrimitive>,
        preferences: Vec<EncodingFormat>,
        timeslice: Duration,
    ) -> Self {
        Self {
            encoder,
            preferences,
            timeslice,
        }
    }

    /// First preferred format the encoder supports
    pub fn negotiate(&self) -> Result<EncodingFormat, SinkError> {
        self.preferences
            .iter()
            .find(|f| self.encoder.is_supported(f))
            .cloned()
            .ok_or_else(|| {
                let tried: Vec<&str> = self.preferences.iter().map(|f| f.mime_type()).collect();
                SinkError::UnsupportedFormat(tried.join(", "))
            })
    }

    pub fn start(
        &self,
        source: SinkSource,
        bitrate_hint: u32,
    ) -> Result<(SinkHandle, mpsc::UnboundedReceiver<SinkEvent>), SinkError> {
        let format = self.negotiate()?;

        // Whatever the microphone buffered since its grant predates the recording
        let (mic_generation, mic) = source.microphone.subscribe();
        let audio = match &mic {
            Some(mic) => {
                let stale = mic.drain_samples();
                tracing::debug!("Discarded {} samples buffered before recording", stale.len());
                PcmFormat::new(mic.sample_rate(), mic.channels())
            }
            None => PcmFormat::new(48_000, 1),
        };

        let params = EncoderParams {
            format: format.clone(),
            resolution: source.resolution,
            frame_rate: source.frame_rate,
            bitrate: bitrate_hint,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
        };
        let session = self.encoder.open(&params)?;

        tracing::info!(
            "Capture sink started: {} at {} @ {}fps, {} bps",
            format,
            source.resolution,
            source.frame_rate,
            bitrate_hint
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let active = Arc::new(AtomicBool::new(true));

        let _ = events_tx.send(SinkEvent::Started {
            format: format.clone(),
        });

        let worker = SinkWorker {
            session: Some(session),
            frames: source.frames,
            microphone: Watched::at(source.microphone, mic_generation),
            camera: Watched::new(source.camera),
            audio,
            converter: None,
            format: format.clone(),
            events: events_tx,
            active: Arc::clone(&active),
        };
        let task = tokio::spawn(worker.run(stop_rx, self.timeslice));

        Ok((
            SinkHandle {
                stop_tx: Mutex::new(Some(stop_tx)),
                active,
                format,
                task: Some(task),
            },
            events_rx,
        ))
    }
}

/// A slot plus the generation last seen
struct Watched<T: ?Sized> {
    slot: TrackSlot<T>,
    generation: u64,
}

impl<T: ?Sized> Watched<T> {
    fn new(slot: TrackSlot<T>) -> Self {
        let generation = slot.generation();
        Self { slot, generation }
    }

    fn at(slot: TrackSlot<T>, generation: u64) -> Self {
        Self { slot, generation }
    }

    /// The current track, and whether it replaced the one seen last time
    fn current(&mut self) -> (Option<Arc<T>>, bool) {
        let (generation, track) = self.slot.subscribe();
        let replaced = generation != self.generation;
        if replaced {
            tracing::debug!("Sink re-subscribed to replaced track");
            self.generation = generation;
        }
        (track, replaced)
    }
}

impl<T: MediaTrack + ?Sized> Watched<T> {
    /// Label of the installed track if it died while still installed
    ///
    /// A switch empties the slot before stopping the old track, so a dead
    /// track whose generation has moved on was replaced, not lost.
    fn ended_track(&self) -> Option<String> {
        let (generation, track) = self.slot.subscribe();
        let track = track?;
        if track.is_live() || !self.slot.is_current(generation) {
            return None;
        }
        Some(track.label().to_string())
    }
}

struct SinkWorker {
    session: Option<Box<dyn EncoderSession>>,
    frames: FrameReceiver,
    microphone: Watched<dyn AudioTrack>,
    camera: Watched<dyn VideoTrack>,
    /// Fixed when the encoder opened
    audio: PcmFormat,
    /// Set while the microphone runs in another format
    converter: Option<PcmConverter>,
    format: EncodingFormat,
    events: mpsc::UnboundedSender<SinkEvent>,
    active: Arc<AtomicBool>,
}

impl SinkWorker {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>, timeslice: Duration) {
        let mut flush = tokio::time::interval(timeslice);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        flush.tick().await;

        let result = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break self.finalize().await,
                changed = self.frames.changed() => {
                    if changed.is_err() {
                        break Err(SinkError::StreamInactive("compositing stream closed".to_string()));
                    }
                    if let Err(e) = self.push_latest_frame() {
                        break Err(e);
                    }
                }
                _ = flush.tick() => {
                    if let Err(e) = self.flush() {
                        break Err(e);
                    }
                }
            }
        };

        self.active.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => tracing::info!("Capture sink stopped"),
            Err(e) => {
                tracing::error!("Capture sink failed: {}", e);
                // Dropping the session discards whatever was in flight
                self.session = None;
                let _ = self.events.send(SinkEvent::Error(e));
            }
        }
    }

    fn session(&mut self) -> Result<&mut Box<dyn EncoderSession>, SinkError> {
        self.session
            .as_mut()
            .ok_or_else(|| SinkError::Encoder("encoder session already finished".to_string()))
    }

    fn push_latest_frame(&mut self) -> Result<(), SinkError> {
        let frame = self.frames.borrow_and_update().clone();
        if let Some(frame) = frame {
            self.session()?.push_video(&frame.surface)?;
        }
        self.push_audio()
    }

    fn push_audio(&mut self) -> Result<(), SinkError> {
        let (mic, replaced) = self.microphone.current();
        let Some(mic) = mic else {
            return Ok(());
        };
        let samples = mic.drain_samples();
        if replaced {
            tracing::debug!(
                "Discarded {} samples buffered by {} before the sink attached",
                samples.len(),
                mic.label()
            );
            self.attach_microphone(PcmFormat::new(mic.sample_rate(), mic.channels()));
            return Ok(());
        }
        if samples.is_empty() {
            return Ok(());
        }

        let samples = match self.converter.as_mut() {
            Some(converter) => converter.convert(&samples),
            None => samples,
        };
        if !samples.is_empty() {
            self.session()?.push_audio(&samples)?;
        }
        Ok(())
    }

    fn attach_microphone(&mut self, format: PcmFormat) {
        self.converter = PcmConverter::between(format, self.audio);
        match &self.converter {
            Some(converter) => tracing::info!(
                "Microphone runs at {}, converting to {}",
                converter.from_format(),
                converter.to_format()
            ),
            None => tracing::debug!("Microphone matches the encoder at {}", self.audio),
        }
    }

    fn check_tracks(&mut self) -> Result<(), SinkError> {
        if let Some(label) = self.microphone.ended_track() {
            return Err(SinkError::StreamInactive(format!("microphone {} ended", label)));
        }
        if let Some(label) = self.camera.ended_track() {
            return Err(SinkError::StreamInactive(format!("camera {} ended", label)));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.check_tracks()?;
        self.push_audio()?;
        self.drain_chunks()
    }

    fn drain_chunks(&mut self) -> Result<(), SinkError> {
        while let Some(chunk) = self.session()?.take_chunk()? {
            if chunk.is_empty() {
                break;
            }
            tracing::debug!("Chunk available: {} bytes", chunk.len());
            let _ = self.events.send(SinkEvent::DataAvailable(chunk));
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), SinkError> {
        if self.frames.has_changed().unwrap_or(false) {
            self.push_latest_frame()?;
        } else {
            self.push_audio()?;
        }
        self.drain_chunks()?;

        let session = self
            .session
            .take()
            .ok_or_else(|| SinkError::Encoder("encoder session already finished".to_string()))?;
        let tail = tokio::task::spawn_blocking(move || session.finish())
            .await
            .map_err(|e| SinkError::Encoder(format!("finish task failed: {}", e)))??;

        if let Some(tail) = tail.filter(|t| !t.is_empty()) {
            let _ = self.events.send(SinkEvent::DataAvailable(tail));
        }
        let _ = self.events.send(SinkEvent::Stopped {
            format: self.format.clone(),
        });
        Ok(())
    }
}

/// Control handle for a running sink
pub struct SinkHandle {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    active: Arc<AtomicBool>,
    format: EncodingFormat,
    task: Option<JoinHandle<()>>,
}

impl SinkHandle {
    pub fn format(&self) -> &EncodingFormat {
        &self.format
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask the sink to finalize. The artifact follows as `Stopped`.
    pub fn stop(&self) -> Result<(), SinkError> {
        if !self.is_active() {
            return Err(SinkError::AlreadyStopped);
        }
        match self.stop_tx.lock().take() {
            Some(tx) => {
                tracing::debug!("Stopping capture sink");
                let _ = tx.send(());
                Ok(())
            }
            None => Err(SinkError::AlreadyStopped),
        }
    }

    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Capture sink task failed: {}", e);
            }
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if self.is_active() {
                tracing::warn!("Capture sink dropped while active, discarding");
            }
            task.abort();
        }
    }
}
