//! Camrec Core - Fragmented MP4 recording pipeline for camera video
//!
//! Feeds live camera video through an external transcoder, parses its
//! fragmented MP4 output into boxes, and hands recording consumers an
//! initialization segment followed by self-contained media fragments. A
//! per-camera pre-record buffer lets recordings start a few seconds in the
//! past.

pub mod config;
pub mod mp4;
pub mod prebuffer;
pub mod recording;
pub mod tracing_setup;
pub mod transcoder;

// Re-export main types for convenient access
pub use config::{CameraConfig, CamrecConfig};
pub use mp4::{BoxReadError, BoxReader, Fragment, FragmentAssembler, Mp4Box};
pub use prebuffer::{PreBuffer, PreBufferError, PreBufferRegistry};
pub use recording::{
    CloseReason, RecordingConfiguration, RecordingError, RecordingPacket, RecordingStream,
    SessionController, StreamId,
};
pub use transcoder::{FfmpegLauncher, TranscoderLauncher, TransportError};

/// Errors that can bubble up from any Camrec subsystem.
#[derive(Debug, thiserror::Error)]
pub enum CamrecError {
    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Pre-record buffer error: {0}")]
    PreBuffer(#[from] PreBufferError),

    #[error("Transcoder error: {0}")]
    Transport(#[from] TransportError),

    #[error("Box stream error: {0}")]
    BoxRead(#[from] BoxReadError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CamrecError {
    /// Short message suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            CamrecError::Recording(e) => match e {
                RecordingError::NoConfiguration { camera } => {
                    format!("Camera '{camera}' has no recording configuration yet")
                }
                RecordingError::NoVideoSource { camera } => {
                    format!("Camera '{camera}' has no video source")
                }
                RecordingError::StreamAlreadyOpen { stream_id } => {
                    format!("Recording stream {stream_id} is already running")
                }
                RecordingError::ProcessSpawnFailure(_) => {
                    "Could not start the transcoder".to_string()
                }
                _ => "Recording stopped unexpectedly".to_string(),
            },
            CamrecError::PreBuffer(_) => "Pre-record buffer unavailable".to_string(),
            CamrecError::Transport(_) => "Transcoder error occurred".to_string(),
            CamrecError::BoxRead(_) => "Transcoder produced an unreadable stream".to_string(),
            CamrecError::Configuration { reason } => format!("Configuration error: {reason}"),
            CamrecError::Io(e) => format!("I/O error: {e}"),
        }
    }
}

/// Result type alias for Camrec operations.
pub type Result<T> = std::result::Result<T, CamrecError>;
