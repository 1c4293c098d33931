//! Type definitions for recording sessions

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mp4::BoxReadError;
use crate::transcoder::TransportError;

/// Identifier the host assigns to a recording stream
pub type StreamId = u32;

/// H.264 profile requested by the recording consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl H264Profile {
    /// Value for the transcoder's `-profile:v` flag.
    pub fn as_arg(&self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        }
    }
}

/// H.264 level requested by the recording consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum H264Level {
    #[serde(rename = "3.1")]
    Level3_1,
    #[serde(rename = "3.2")]
    Level3_2,
    #[serde(rename = "4.0")]
    Level4_0,
}

impl H264Level {
    /// Value for the transcoder's `-level:v` flag.
    pub fn as_arg(&self) -> &'static str {
        match self {
            H264Level::Level3_1 => "3.1",
            H264Level::Level3_2 => "3.2",
            H264Level::Level4_0 => "4.0",
        }
    }
}

/// Video parameters of a recording configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodecParameters {
    pub profile: H264Profile,
    pub level: H264Level,
    /// Target bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Distance between forced keyframes
    pub iframe_interval_ms: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// AAC flavour requested for the audio track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    AacLc,
    AacEld,
}

impl AudioCodec {
    /// Encoder name and `-profile:a` value.
    pub fn encoder_args(&self) -> (&'static str, &'static str) {
        match self {
            AudioCodec::AacLc => ("aac", "aac_low"),
            AudioCodec::AacEld => ("libfdk_aac", "aac_eld"),
        }
    }
}

/// Audio parameters of a recording configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCodecParameters {
    pub codec: AudioCodec,
    pub channels: u8,
    /// Sample rate in kHz (8, 16, 24, 32, 44.1 is sent as 44, 48)
    pub sample_rate_khz: u32,
    /// Bitrate in kbit/s
    pub bitrate_kbps: u32,
}

impl AudioCodecParameters {
    /// Sample rate in Hz.
    pub fn sample_rate_hz(&self) -> u32 {
        match self.sample_rate_khz {
            44 => 44_100,
            khz => khz.saturating_mul(1000),
        }
    }
}

/// Recording parameters negotiated by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingConfiguration {
    /// How much pre-recorded video the consumer wants
    pub prebuffer_length_ms: u64,
    /// Preferred media fragment length
    pub fragment_length_ms: u64,
    pub video: VideoCodecParameters,
    pub audio: AudioCodecParameters,
}

impl Default for RecordingConfiguration {
    fn default() -> Self {
        Self {
            prebuffer_length_ms: 4000,
            fragment_length_ms: 4000,
            video: VideoCodecParameters {
                profile: H264Profile::Main,
                level: H264Level::Level4_0,
                bitrate_kbps: 2000,
                iframe_interval_ms: 4000,
                width: 1920,
                height: 1080,
                fps: 30,
            },
            audio: AudioCodecParameters {
                codec: AudioCodec::AacLc,
                channels: 1,
                sample_rate_khz: 32,
                bitrate_kbps: 64,
            },
        }
    }
}

/// Why the host closed a recording stream
///
/// Only used for diagnostics; teardown is identical for every reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    GenericError,
    NetworkIssue,
    ResourceShortage,
    Busy,
    BufferShortage,
    FormatIncompatibility,
    MaxDurationExceeded,
    StorageFull,
    Unknown,
}

impl CloseReason {
    /// Maps the host's numeric reason code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => CloseReason::Normal,
            1 => CloseReason::GenericError,
            2 => CloseReason::NetworkIssue,
            3 => CloseReason::ResourceShortage,
            4 => CloseReason::Busy,
            5 => CloseReason::BufferShortage,
            6 => CloseReason::FormatIncompatibility,
            7 => CloseReason::MaxDurationExceeded,
            8 => CloseReason::StorageFull,
            _ => CloseReason::Unknown,
        }
    }

    /// True for an ordinary end of recording.
    pub fn is_normal(&self) -> bool {
        matches!(self, CloseReason::Normal)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Normal => "normal end",
            CloseReason::GenericError => "generic error",
            CloseReason::NetworkIssue => "network issue",
            CloseReason::ResourceShortage => "resource shortage",
            CloseReason::Busy => "busy",
            CloseReason::BufferShortage => "buffer shortage",
            CloseReason::FormatIncompatibility => "format incompatibility",
            CloseReason::MaxDurationExceeded => "max duration exceeded",
            CloseReason::StorageFull => "storage full",
            CloseReason::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by recording sessions
#[derive(Debug, Error)]
pub enum RecordingError {
    /// Stream opened before the host supplied a configuration
    #[error("No recording configuration for camera '{camera}'")]
    NoConfiguration {
        /// Camera name
        camera: String,
    },

    /// Camera has no video source configured
    #[error("No video source configured for camera '{camera}'")]
    NoVideoSource {
        /// Camera name
        camera: String,
    },

    /// Stream id already has an open session
    #[error("Recording stream {stream_id} is already open")]
    StreamAlreadyOpen {
        /// Conflicting stream id
        stream_id: StreamId,
    },

    /// Transcoder could not be started
    #[error("Failed to start recording transcoder: {0}")]
    ProcessSpawnFailure(#[source] TransportError),

    /// Box stream from the transcoder failed
    #[error("Recording stream failed: {0}")]
    BoxStream(#[from] BoxReadError),

    /// Transcoder output could not be read
    #[error("Recording transport failed: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::from_code(0), CloseReason::Normal);
        assert_eq!(CloseReason::from_code(4), CloseReason::Busy);
        assert_eq!(CloseReason::from_code(8), CloseReason::StorageFull);
        assert_eq!(CloseReason::from_code(42), CloseReason::Unknown);
        assert!(CloseReason::Normal.is_normal());
        assert!(!CloseReason::NetworkIssue.is_normal());
        assert_eq!(
            CloseReason::MaxDurationExceeded.to_string(),
            "max duration exceeded"
        );
    }

    #[test]
    fn test_codec_argument_vocabulary() {
        assert_eq!(H264Profile::High.as_arg(), "high");
        assert_eq!(H264Level::Level3_2.as_arg(), "3.2");
        assert_eq!(AudioCodec::AacEld.encoder_args(), ("libfdk_aac", "aac_eld"));
    }

    #[test]
    fn test_sample_rate_conversion() {
        let mut audio = RecordingConfiguration::default().audio;
        assert_eq!(audio.sample_rate_hz(), 32_000);

        audio.sample_rate_khz = 44;
        assert_eq!(audio.sample_rate_hz(), 44_100);

        audio.sample_rate_khz = u32::MAX;
        assert_eq!(audio.sample_rate_hz(), u32::MAX);
    }

    #[test]
    fn test_configuration_from_json() {
        let json = r#"{
            "prebuffer_length_ms": 4000,
            "fragment_length_ms": 4000,
            "video": {
                "profile": "high",
                "level": "4.0",
                "bitrate_kbps": 1500,
                "iframe_interval_ms": 4000,
                "width": 1280,
                "height": 720,
                "fps": 24
            },
            "audio": {
                "codec": "aac_eld",
                "channels": 1,
                "sample_rate_khz": 16,
                "bitrate_kbps": 32
            }
        }"#;

        let config: RecordingConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.video.profile, H264Profile::High);
        assert_eq!(config.video.level, H264Level::Level4_0);
        assert_eq!(config.audio.codec, AudioCodec::AacEld);
        assert_eq!(config.video.width, 1280);
    }
}
