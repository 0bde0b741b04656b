//! Media sources
//!
//! Camera and microphone access, the match video, and the manager that owns
//! the single live stream.

pub mod manager;
pub mod match_video;
pub mod ring;
pub mod traits;

#[cfg(feature = "native-devices")]
pub mod native;

pub use manager::{
    ActiveStream, CameraSlot, MediaGrant, MediaSourceManager, MicrophoneSlot, SwitchRequest,
    TrackSlot,
};
pub use match_video::{FileMatchVideo, MatchVideo, VideoProbe};
pub use ring::{SampleRing, MAX_BUFFERED_AUDIO};
pub use traits::{
    AudioConstraints, AudioTrack, MediaConstraints, MediaError, MediaKind, MediaPlatform,
    MediaSourceDescriptor, MediaTrack, PlatformGrant, Resolution, SourceList, VideoConstraints,
    VideoTrack,
};

#[cfg(feature = "native-devices")]
pub use native::NativePlatform;
