//! Recording
//!
//! - `CaptureSink` taps composited frames and the microphone into an encoder
//! - `FfmpegEncoder` is the encoder used outside of tests
//! - `ReviewSession` owns the phase and every resource of one review

pub mod chunks;
pub mod ffmpeg;
pub mod resample;
pub mod session;
pub mod sink;
pub mod state;

pub use chunks::{EncodingFormat, RecordedChunks, ReviewArtifact};
pub use ffmpeg::FfmpegEncoder;
pub use resample::{PcmConverter, PcmFormat};
pub use session::{
    ReviewSession, SessionCollaborators, SessionEvent, SessionEventKind, SessionStatus,
};
pub use sink::{
    CaptureSink, EncodePrimitive, EncoderParams, EncoderSession, SinkError, SinkEvent,
    SinkHandle, SinkSource,
};
pub use state::{ReviewConfig, SessionPhase};
