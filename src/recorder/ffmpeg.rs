//! FFmpeg encode primitive
//!
//! Composited RGBA frames go to ffmpeg's stdin, microphone PCM over a
//! loopback TCP connection, and the muxed container comes back on stdout,
//! where a reader thread collects it until the sink drains it as a chunk.

use super::chunks::EncodingFormat;
use super::sink::{EncodePrimitive, EncoderParams, EncoderSession, SinkError};
use crate::compositor::Surface;
use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

const STDERR_TAIL_LINES: usize = 20;

/// Frames queued for the stdin writer before new ones are dropped
const VIDEO_QUEUE_FRAMES: usize = 8;

/// PCM blocks queued for the socket writer before new ones are dropped
const AUDIO_QUEUE_BLOCKS: usize = 64;

/// ffmpeg encoders needed for one format
#[derive(Debug, Clone, PartialEq, Eq)]
struct CodecPlan {
    muxer: &'static str,
    video: &'static str,
    audio: &'static str,
}

impl CodecPlan {
    fn for_format(format: &EncodingFormat) -> anyhow::Result<Self> {
        let codecs = format.codecs();
        let has = |name: &str| codecs.iter().any(|c| c.starts_with(name));

        match format.container() {
            "webm" => {
                if !codecs.is_empty() && !has("opus") {
                    bail!("webm audio must be opus: {}", format);
                }
                let video = if has("vp8") && !has("vp9") {
                    "libvpx"
                } else {
                    "libvpx-vp9"
                };
                Ok(Self {
                    muxer: "webm",
                    video,
                    audio: "libopus",
                })
            }
            "mp4" => {
                if !codecs.is_empty() && !(has("avc1") || has("h264")) {
                    bail!("unsupported mp4 video codec: {}", format);
                }
                Ok(Self {
                    muxer: "mp4",
                    video: "libx264",
                    audio: "aac",
                })
            }
            other => bail!("unsupported container {:?}", other),
        }
    }
}

/// Encoder backed by the local ffmpeg binary
pub struct FfmpegEncoder {
    binary: String,
    encoders: OnceLock<HashSet<String>>,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            encoders: OnceLock::new(),
        }
    }

    fn encoders(&self) -> &HashSet<String> {
        self.encoders.get_or_init(|| match self.list_encoders() {
            Ok(set) => {
                tracing::debug!("ffmpeg reports {} encoders", set.len());
                set
            }
            Err(e) => {
                tracing::warn!("Could not query ffmpeg encoders: {:#}", e);
                HashSet::new()
            }
        })
    }

    fn list_encoders(&self) -> anyhow::Result<HashSet<String>> {
        let output = Command::new(&self.binary)
            .args(["-hide_banner", "-encoders"])
            .output()
            .with_context(|| format!("failed to run {}", self.binary))?;
        if !output.status.success() {
            bail!("{} -encoders exited with {}", self.binary, output.status);
        }
        Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn build_args(plan: &CodecPlan, params: &EncoderParams, audio_port: Option<u16>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgba".into(),
            "-s".into(),
            params.resolution.to_string(),
            "-r".into(),
            params.frame_rate.to_string(),
            "-i".into(),
            "-".into(),
        ];

        if let Some(port) = audio_port {
            args.extend([
                "-f".into(),
                "f32le".into(),
                "-ar".into(),
                params.sample_rate.to_string(),
                "-ac".into(),
                params.channels.to_string(),
                "-i".into(),
                format!("tcp://127.0.0.1:{}", port),
                "-c:a".into(),
                plan.audio.into(),
            ]);
        }

        args.extend([
            "-c:v".into(),
            plan.video.into(),
            "-b:v".into(),
            params.bitrate.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);

        match plan.muxer {
            // The output is a pipe, so the moov atom can't be written at the end
            "mp4" => args.extend([
                "-movflags".into(),
                "frag_keyframe+empty_moov+default_base_moof".into(),
            ]),
            _ => args.extend(["-deadline".into(), "realtime".into()]),
        }

        args.extend(["-f".into(), plan.muxer.into(), "-".into()]);
        args
    }
}

/// Parse `ffmpeg -encoders` output into encoder names
fn parse_encoder_list(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            if flags.len() != 6 {
                return None;
            }
            parts.next().map(str::to_string)
        })
        .collect()
}

impl EncodePrimitive for FfmpegEncoder {
    fn is_supported(&self, format: &EncodingFormat) -> bool {
        let Ok(plan) = CodecPlan::for_format(format) else {
            return false;
        };
        let encoders = self.encoders();
        encoders.contains(plan.video) && encoders.contains(plan.audio)
    }

    fn open(&self, params: &EncoderParams) -> Result<Box<dyn EncoderSession>, SinkError> {
        let plan = CodecPlan::for_format(&params.format)
            .map_err(|e| SinkError::UnsupportedFormat(e.to_string()))?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let args = Self::build_args(&plan, params, Some(port));

        tracing::info!("Starting ffmpeg encoder: {:?}", args);

        let mut process = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SinkError::Encoder(format!("failed to start ffmpeg: {}", e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| SinkError::Encoder("failed to capture ffmpeg stdin".to_string()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| SinkError::Encoder("failed to capture ffmpeg stdout".to_string()))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| SinkError::Encoder("failed to capture ffmpeg stderr".to_string()))?;

        let failure = Arc::new(Mutex::new(None));
        let output = Arc::new(Mutex::new(BytesMut::new()));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        let (video_in, video_rx) = BoundedInput::new("video", VIDEO_QUEUE_FRAMES);
        let video_failure = Arc::clone(&failure);
        let video_writer = std::thread::Builder::new()
            .name("ffmpeg-video-in".to_string())
            .spawn(move || write_all_from(video_rx, stdin, &video_failure))?;

        let (audio_in, audio_rx) = BoundedInput::new("audio", AUDIO_QUEUE_BLOCKS);
        let closed = Arc::new(AtomicBool::new(false));
        let audio_closed = Arc::clone(&closed);
        let audio_failure = Arc::clone(&failure);
        let audio_writer = std::thread::Builder::new()
            .name("ffmpeg-audio-in".to_string())
            .spawn(move || {
                if let Some(socket) = accept_until_closed(&listener, &audio_closed, &audio_failure) {
                    write_all_from(audio_rx, socket, &audio_failure);
                }
            })?;

        let reader_output = Arc::clone(&output);
        let reader_failure = Arc::clone(&failure);
        let reader = std::thread::Builder::new()
            .name("ffmpeg-out".to_string())
            .spawn(move || read_output(stdout, &reader_output, &reader_failure))?;

        let tail = Arc::clone(&stderr_tail);
        let stderr_reader = std::thread::Builder::new()
            .name("ffmpeg-err".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    tracing::debug!("ffmpeg: {}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })?;

        Ok(Box::new(FfmpegSession {
            process: Some(process),
            video_in: Some(video_in),
            audio_in: Some(audio_in),
            threads: vec![video_writer, audio_writer, reader, stderr_reader],
            closed,
            output,
            failure,
            stderr_tail,
            frame_size: params.resolution.pixel_count() * 4,
            frames_written: 0,
        }))
    }
}

/// Queue to a writer thread that never blocks the caller
///
/// A full queue means ffmpeg is not keeping up; the new buffer is dropped
/// and counted instead of stalling the sink.
struct BoundedInput {
    name: &'static str,
    tx: mpsc::SyncSender<Vec<u8>>,
    dropped: u64,
}

impl BoundedInput {
    fn new(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (
            Self {
                name,
                tx,
                dropped: 0,
            },
            rx,
        )
    }

    /// False when the buffer was dropped
    fn offer(&mut self, buf: Vec<u8>) -> Result<bool, SinkError> {
        match self.tx.try_send(buf) {
            Ok(()) => Ok(true),
            Err(mpsc::TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped % 100 == 0 {
                    tracing::warn!(
                        "ffmpeg {} input is behind, {} buffers dropped",
                        self.name,
                        self.dropped
                    );
                }
                Ok(false)
            }
            Err(mpsc::TrySendError::Disconnected(_)) => Err(SinkError::Encoder(format!(
                "ffmpeg {} input closed",
                self.name
            ))),
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn record_failure(failure: &Mutex<Option<String>>, message: String) {
    let mut slot = failure.lock();
    if slot.is_none() {
        tracing::error!("ffmpeg pipe failed: {}", message);
        *slot = Some(message);
    }
}

/// Wait for ffmpeg to connect to the audio socket
fn accept_until_closed(
    listener: &TcpListener,
    closed: &AtomicBool,
    failure: &Mutex<Option<String>>,
) -> Option<TcpStream> {
    if let Err(e) = listener.set_nonblocking(true) {
        record_failure(failure, format!("audio socket: {}", e));
        return None;
    }
    while !closed.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((socket, _)) => {
                // Writes should block like a pipe
                return match socket.set_nonblocking(false) {
                    Ok(()) => Some(socket),
                    Err(e) => {
                        record_failure(failure, format!("audio socket: {}", e));
                        None
                    }
                };
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                record_failure(failure, format!("audio socket: {}", e));
                return None;
            }
        }
    }
    None
}

/// Copy queued buffers into `sink` until the sender hangs up
fn write_all_from(rx: mpsc::Receiver<Vec<u8>>, mut sink: impl Write, failure: &Mutex<Option<String>>) {
    for buf in rx {
        if let Err(e) = sink.write_all(&buf) {
            record_failure(failure, e.to_string());
            return;
        }
    }
    let _ = sink.flush();
}

fn read_output(mut stdout: impl Read, output: &Mutex<BytesMut>, failure: &Mutex<Option<String>>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => output.lock().extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                record_failure(failure, e.to_string());
                return;
            }
        }
    }
}

struct FfmpegSession {
    process: Option<Child>,
    video_in: Option<BoundedInput>,
    audio_in: Option<BoundedInput>,
    threads: Vec<JoinHandle<()>>,
    /// Set once ffmpeg has exited, releases a pending audio accept
    closed: Arc<AtomicBool>,
    output: Arc<Mutex<BytesMut>>,
    failure: Arc<Mutex<Option<String>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    frame_size: usize,
    frames_written: u64,
}

impl FfmpegSession {
    fn check(&self) -> Result<(), SinkError> {
        match self.failure.lock().as_ref() {
            Some(message) => Err(SinkError::Encoder(format!(
                "{} ({})",
                message,
                self.stderr_summary()
            ))),
            None => Ok(()),
        }
    }

    fn stderr_summary(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl EncoderSession for FfmpegSession {
    fn push_video(&mut self, frame: &Surface) -> Result<(), SinkError> {
        self.check()?;
        if frame.data().len() != self.frame_size {
            return Err(SinkError::Encoder(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data().len(),
                self.frame_size
            )));
        }
        let input = self
            .video_in
            .as_mut()
            .ok_or_else(|| SinkError::Encoder("video input closed".to_string()))?;
        if input.offer(frame.data().to_vec())? {
            self.frames_written += 1;
        }
        Ok(())
    }

    fn push_audio(&mut self, samples: &[f32]) -> Result<(), SinkError> {
        self.check()?;
        let Some(input) = self.audio_in.as_mut() else {
            return Ok(());
        };
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        input.offer(bytes).map(|_| ())
    }

    fn take_chunk(&mut self) -> Result<Option<Bytes>, SinkError> {
        self.check()?;
        let mut output = self.output.lock();
        if output.is_empty() {
            return Ok(None);
        }
        Ok(Some(output.split().freeze()))
    }

    fn finish(mut self: Box<Self>) -> Result<Option<Bytes>, SinkError> {
        // Closing the inputs lets ffmpeg flush and exit
        let dropped_frames = self.video_in.take().map_or(0, |input| input.dropped());
        let dropped_audio = self.audio_in.take().map_or(0, |input| input.dropped());

        let status = match self.process.take() {
            Some(mut process) => process.wait()?,
            None => return Err(SinkError::Encoder("ffmpeg already finished".to_string())),
        };
        self.closed.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        tracing::info!(
            "ffmpeg encoder finished after {} frames ({})",
            self.frames_written,
            status
        );
        if dropped_frames > 0 || dropped_audio > 0 {
            tracing::warn!(
                "ffmpeg fell behind: {} frames and {} audio blocks dropped",
                dropped_frames,
                dropped_audio
            );
        }

        if !status.success() {
            return Err(SinkError::Encoder(format!(
                "ffmpeg exited with {}: {}",
                status,
                self.stderr_summary()
            )));
        }
        self.check()?;

        let rest = self.output.lock().split().freeze();
        Ok((!rest.is_empty()).then_some(rest))
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Resolution;

    const LISTING: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D libvpx-vp9           libvpx VP9 (codec vp9)
 A....D aac                  AAC (Advanced Audio Coding)
 A....D libopus              libopus Opus (codec opus)
";

    #[test]
    fn test_parse_encoder_list() {
        let set = parse_encoder_list(LISTING);
        assert!(set.contains("libx264"));
        assert!(set.contains("libopus"));
        assert!(!set.contains("V....."));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_codec_plans() {
        let vp8 = CodecPlan::for_format(&EncodingFormat::new("video/webm;codecs=vp8,opus")).unwrap();
        assert_eq!(vp8.video, "libvpx");

        let webm = CodecPlan::for_format(&EncodingFormat::new("video/webm")).unwrap();
        assert_eq!(webm.video, "libvpx-vp9");

        let mp4 = CodecPlan::for_format(&EncodingFormat::new("video/mp4;codecs=avc1,mp4a")).unwrap();
        assert_eq!(mp4.audio, "aac");

        assert!(CodecPlan::for_format(&EncodingFormat::new("video/ogg")).is_err());
        assert!(CodecPlan::for_format(&EncodingFormat::new("video/webm;codecs=vp9,vorbis")).is_err());
    }

    #[test]
    fn test_mp4_args_are_fragmented() {
        let plan = CodecPlan::for_format(&EncodingFormat::new("video/mp4")).unwrap();
        let params = EncoderParams {
            format: EncodingFormat::new("video/mp4"),
            resolution: Resolution::HD,
            frame_rate: 30,
            bitrate: 2_000_000,
            sample_rate: 48_000,
            channels: 2,
        };
        let args = FfmpegEncoder::build_args(&plan, &params, Some(9000));
        assert!(args.iter().any(|a| a.contains("empty_moov")));
        assert!(args.contains(&"tcp://127.0.0.1:9000".to_string()));
        assert!(args.contains(&"1280x720".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_full_input_drops_instead_of_blocking() {
        let (mut input, rx) = BoundedInput::new("video", 2);
        assert!(input.offer(vec![1]).unwrap());
        assert!(input.offer(vec![2]).unwrap());
        // Nobody is writing; the third buffer is dropped
        assert!(!input.offer(vec![3]).unwrap());
        assert_eq!(input.dropped(), 1);

        assert_eq!(rx.recv().unwrap(), vec![1]);
        assert!(input.offer(vec![4]).unwrap());
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![vec![2], vec![4]]);
    }

    #[test]
    fn test_closed_input_is_an_error() {
        let (mut input, rx) = BoundedInput::new("audio", 4);
        drop(rx);
        assert!(matches!(input.offer(vec![0]), Err(SinkError::Encoder(_))));
    }
}
