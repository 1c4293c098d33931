//! Recording sessions
//!
//! `SessionController` turns stream-open requests into `RecordingStream`s:
//! a transcoder per session, its output parsed into boxes and assembled into
//! an initialization segment followed by media fragments.

pub mod controller;
pub mod stream;
pub mod types;

pub use controller::SessionController;
pub use stream::{RecordingPacket, RecordingStream};
pub use types::{
    AudioCodec, AudioCodecParameters, CloseReason, H264Level, H264Profile, RecordingConfiguration,
    RecordingError, RecordingResult, StreamId, VideoCodecParameters,
};
