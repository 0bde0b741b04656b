//! Match video source
//!
//! The uploaded match video plays underneath the narration. Its native size
//! fixes the size of every composited frame.

use super::traits::{MediaError, Resolution};
use crate::compositor::Surface;
use anyhow::{anyhow, bail, Context};
use parking_lot::RwLock;
use serde::Deserialize;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A playable match video
pub trait MatchVideo: Send + Sync {
    /// Native frame size, None until metadata has loaded
    fn native_resolution(&self) -> Option<Resolution>;

    /// Total duration, None until metadata has loaded
    fn duration(&self) -> Option<Duration>;

    /// The frame currently being displayed
    fn current_frame(&self) -> Option<Arc<Surface>>;

    fn play(&self) -> Result<(), MediaError>;

    fn pause(&self);

    fn is_paused(&self) -> bool;

    fn has_metadata(&self) -> bool {
        self.native_resolution().map(|r| !r.is_empty()).unwrap_or(false)
            && self.duration().is_some()
    }
}

/// Metadata reported by ffprobe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    pub resolution: Resolution,
    pub fps: f64,
    pub duration: Duration,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl VideoProbe {
    /// Probe a file with ffprobe
    pub fn run(path: &Path) -> anyhow::Result<Self> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate:format=duration",
                "-of",
                "json",
            ])
            .arg(path)
            .output()
            .context("failed to run ffprobe")?;

        if !output.status.success() {
            bail!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Self::parse(&output.stdout)
    }

    fn parse(json: &[u8]) -> anyhow::Result<Self> {
        let probe: ProbeOutput = serde_json::from_slice(json).context("bad ffprobe output")?;
        let stream = probe
            .streams
            .first()
            .ok_or_else(|| anyhow!("no video stream"))?;

        let width = stream.width.ok_or_else(|| anyhow!("missing width"))?;
        let height = stream.height.ok_or_else(|| anyhow!("missing height"))?;

        // "30/1" or "30000/1001"
        let fps = stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(30.0);

        let duration = probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
            .ok_or_else(|| anyhow!("missing duration"))?;

        Ok(Self {
            resolution: Resolution::new(width, height),
            fps,
            duration: Duration::try_from_secs_f64(duration)
                .with_context(|| format!("duration {}s out of range", duration))?,
        })
    }

    /// Time between decoded frames at the probed rate
    pub fn frame_interval(&self) -> Result<Duration, MediaError> {
        Duration::try_from_secs_f64(1.0 / self.fps).map_err(|e| {
            MediaError::Source(format!("unusable frame rate {}fps: {}", self.fps, e))
        })
    }
}

fn parse_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate.parse().ok(),
    }
}

struct PlaybackShared {
    frame: RwLock<Option<Arc<Surface>>>,
    paused: AtomicBool,
    running: AtomicBool,
}

/// Match video decoded from a local file through ffmpeg
pub struct FileMatchVideo {
    path: PathBuf,
    probe: VideoProbe,
    shared: Arc<PlaybackShared>,
    decoder: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl FileMatchVideo {
    /// Probe `path` and prepare it for playback
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MediaError> {
        let path = path.into();
        let probe = VideoProbe::run(&path).map_err(|e| MediaError::Source(format!("{:#}", e)))?;

        tracing::info!(
            "Opened match video {:?}: {} @ {:.2}fps, {:.1}s",
            path,
            probe.resolution,
            probe.fps,
            probe.duration.as_secs_f64()
        );

        Ok(Self {
            path,
            probe,
            shared: Arc::new(PlaybackShared {
                frame: RwLock::new(None),
                paused: AtomicBool::new(true),
                running: AtomicBool::new(false),
            }),
            decoder: parking_lot::Mutex::new(None),
        })
    }

    pub fn probe(&self) -> &VideoProbe {
        &self.probe
    }

    fn spawn_decoder(&self) -> Result<JoinHandle<()>, MediaError> {
        let res = self.probe.resolution;
        let mut process = Command::new("ffmpeg")
            .arg("-i")
            .arg(&self.path)
            .args([
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &res.to_string(),
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MediaError::Source(format!("failed to start ffmpeg decoder: {}", e)))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| MediaError::Source("failed to capture ffmpeg stdout".to_string()))?;

        let shared = Arc::clone(&self.shared);
        let frame_interval = self.probe.frame_interval()?;

        std::thread::Builder::new()
            .name("match-video-decoder".to_string())
            .spawn(move || decode_loop(process, stdout, res, frame_interval, shared))
            .map_err(|e| MediaError::Source(format!("failed to spawn decoder thread: {}", e)))
    }
}

fn decode_loop(
    mut process: Child,
    stdout: impl Read,
    res: Resolution,
    frame_interval: Duration,
    shared: Arc<PlaybackShared>,
) {
    let frame_size = res.pixel_count() * 4;
    let mut reader = BufReader::with_capacity(frame_size * 2, stdout);
    let mut next_due = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        if shared.paused.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(10));
            next_due = Instant::now();
            continue;
        }

        let mut buffer = vec![0u8; frame_size];
        match reader.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::info!("Match video reached the end");
                shared.paused.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                tracing::error!("Match video decode failed: {}", e);
                shared.paused.store(true, Ordering::SeqCst);
                break;
            }
        }

        match Surface::from_rgba(res.width, res.height, buffer) {
            Ok(surface) => *shared.frame.write() = Some(Arc::new(surface)),
            Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
        }

        next_due += frame_interval;
        let now = Instant::now();
        if next_due > now {
            std::thread::sleep(next_due - now);
        }
    }

    let _ = process.kill();
    let _ = process.wait();
}

impl MatchVideo for FileMatchVideo {
    fn native_resolution(&self) -> Option<Resolution> {
        Some(self.probe.resolution)
    }

    fn duration(&self) -> Option<Duration> {
        Some(self.probe.duration)
    }

    fn current_frame(&self) -> Option<Arc<Surface>> {
        self.shared.frame.read().clone()
    }

    fn play(&self) -> Result<(), MediaError> {
        let mut decoder = self.decoder.lock();
        if decoder.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
            self.shared.running.store(true, Ordering::SeqCst);
            *decoder = Some(self.spawn_decoder()?);
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }
}

impl Drop for FileMatchVideo {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.decoder.lock().take() {
            let _ = handle.join();
        }
    }
}
