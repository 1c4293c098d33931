//! Centralized configuration for Camrec.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mp4::DEFAULT_MAX_BOX_SIZE;

/// Central configuration for all Camrec components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct CamrecConfig {
    pub transcoder: TranscoderConfig,
    pub prebuffer: PreBufferConfig,
}

/// How the transcoder hands its output back to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTransportKind {
    /// Transcoder connects to an ephemeral listener on 127.0.0.1
    Loopback,
    /// Transcoder writes to its own stdout
    DirectPipe,
}

impl std::str::FromStr for OutputTransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loopback" | "tcp" => Ok(OutputTransportKind::Loopback),
            "pipe" | "direct_pipe" | "stdout" => Ok(OutputTransportKind::DirectPipe),
            _ => Err(format!("Invalid output transport: {s}")),
        }
    }
}

/// External transcoder process configuration.
///
/// Controls how the process is launched, how its output is wired, and the
/// grace periods of the stop sequence.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Transcoder binary
    pub executable: PathBuf,
    /// Output wiring for recording sessions
    pub output_transport: OutputTransportKind,
    /// Ports tried for loopback listeners
    pub loopback_ports: RangeInclusive<u16>,
    /// Bind attempts before giving up on a loopback listener
    pub bind_attempts: u32,
    /// How long to wait for the transcoder to connect to its listener
    pub connect_timeout: Duration,
    /// Wait after the quit directive before sending a terminate signal
    pub quit_grace: Duration,
    /// Wait after the terminate signal before killing the process
    pub terminate_grace: Duration,
    /// Exit codes that mean "input ended" rather than a real failure
    pub expected_abnormal_codes: Vec<i32>,
    /// Largest box payload accepted from the transcoder
    pub max_box_size: usize,
    /// Verbose transcoder logging
    pub debug: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("ffmpeg"),
            output_transport: OutputTransportKind::Loopback,
            loopback_ports: 10_000..=40_000,
            bind_attempts: 16,
            connect_timeout: Duration::from_secs(30),
            quit_grace: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(3),
            expected_abnormal_codes: vec![255],
            max_box_size: DEFAULT_MAX_BOX_SIZE,
            debug: false,
        }
    }
}

/// Pre-record buffer configuration.
#[derive(Debug, Clone)]
pub struct PreBufferConfig {
    /// How far back retained boxes reach
    pub retention_window: Duration,
    /// Replay listener closes if nobody connects within this time
    pub replay_timeout: Duration,
    /// Live boxes queued per replay consumer before it is considered lagging
    pub live_capacity: usize,
}

impl Default for PreBufferConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(15),
            replay_timeout: Duration::from_secs(30),
            live_capacity: 256,
        }
    }
}

/// Per-camera settings supplied by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Display name used in logs
    pub name: String,
    /// Transcoder input tokens, e.g. `-rtsp_transport tcp -i rtsp://cam/stream`
    pub source: String,
    /// Whether the recording carries the camera's audio
    pub audio_enabled: bool,
    /// Whether a pre-record buffer runs for this camera
    pub prebuffer_enabled: bool,
    /// Video encoder passed to the transcoder
    pub video_codec: Option<String>,
    /// Extra output arguments appended before the destination
    pub extra_output_args: Vec<String>,
}

impl CameraConfig {
    /// Creates a camera with a name and input source.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    /// Source split into argument tokens.
    pub fn source_tokens(&self) -> Vec<String> {
        self.source.split_whitespace().map(str::to_string).collect()
    }

    /// Video encoder, `libx264` unless overridden.
    pub fn video_codec(&self) -> &str {
        self.video_codec.as_deref().unwrap_or("libx264")
    }
}

impl CamrecConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CAMREC_FFMPEG_PATH")
            && !path.is_empty()
        {
            config.transcoder.executable = PathBuf::from(path);
        }

        if let Ok(transport) = std::env::var("CAMREC_OUTPUT_TRANSPORT")
            && let Ok(kind) = transport.parse::<OutputTransportKind>()
        {
            config.transcoder.output_transport = kind;
        }

        if let Ok(millis) = std::env::var("CAMREC_QUIT_GRACE_MS")
            && let Ok(millis) = millis.parse::<u64>()
        {
            config.transcoder.quit_grace = Duration::from_millis(millis);
        }

        if let Ok(millis) = std::env::var("CAMREC_TERMINATE_GRACE_MS")
            && let Ok(millis) = millis.parse::<u64>()
        {
            config.transcoder.terminate_grace = Duration::from_millis(millis);
        }

        if let Ok(millis) = std::env::var("CAMREC_PREBUFFER_MS")
            && let Ok(millis) = millis.parse::<u64>()
        {
            config.prebuffer.retention_window = Duration::from_millis(millis);
        }

        if let Ok(debug) = std::env::var("CAMREC_TRANSCODER_DEBUG") {
            config.transcoder.debug = debug.parse().unwrap_or(false);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            transcoder: TranscoderConfig {
                connect_timeout: Duration::from_secs(5),
                quit_grace: Duration::from_millis(200),
                terminate_grace: Duration::from_millis(200),
                ..Default::default()
            },
            prebuffer: PreBufferConfig {
                retention_window: Duration::from_secs(2),
                replay_timeout: Duration::from_secs(2),
                live_capacity: 64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = CamrecConfig::default();

        assert_eq!(config.transcoder.executable, PathBuf::from("ffmpeg"));
        assert_eq!(
            config.transcoder.output_transport,
            OutputTransportKind::Loopback
        );
        assert_eq!(config.transcoder.expected_abnormal_codes, vec![255]);
        assert_eq!(config.prebuffer.retention_window, Duration::from_secs(15));
        assert_eq!(config.prebuffer.replay_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_testing_preset_shortens_timeouts() {
        let config = CamrecConfig::for_testing();
        let defaults = CamrecConfig::default();

        assert!(config.transcoder.quit_grace < defaults.transcoder.quit_grace);
        assert!(config.transcoder.terminate_grace < defaults.transcoder.terminate_grace);
        assert!(config.prebuffer.replay_timeout < defaults.prebuffer.replay_timeout);
    }

    #[test]
    fn test_output_transport_parsing() {
        assert_eq!(
            "tcp".parse::<OutputTransportKind>(),
            Ok(OutputTransportKind::Loopback)
        );
        assert_eq!(
            "PIPE".parse::<OutputTransportKind>(),
            Ok(OutputTransportKind::DirectPipe)
        );
        assert!("udp".parse::<OutputTransportKind>().is_err());
    }

    #[test]
    fn test_camera_source_tokens() {
        let camera = CameraConfig::new("Porch", "-rtsp_transport tcp  -i rtsp://cam/1");
        assert_eq!(
            camera.source_tokens(),
            vec!["-rtsp_transport", "tcp", "-i", "rtsp://cam/1"]
        );
        assert_eq!(camera.video_codec(), "libx264");
    }

    #[test]
    fn test_camera_config_from_json() {
        let camera: CameraConfig = serde_json::from_str(
            r#"{"name":"Yard","source":"-i rtsp://yard","prebuffer_enabled":true}"#,
        )
        .unwrap();

        assert_eq!(camera.name, "Yard");
        assert!(camera.prebuffer_enabled);
        assert!(!camera.audio_enabled);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("CAMREC_FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
            std::env::set_var("CAMREC_OUTPUT_TRANSPORT", "pipe");
            std::env::set_var("CAMREC_PREBUFFER_MS", "4000");
            std::env::set_var("CAMREC_QUIT_GRACE_MS", "500");
        }

        let config = CamrecConfig::from_env();

        assert_eq!(
            config.transcoder.executable,
            PathBuf::from("/opt/ffmpeg/bin/ffmpeg")
        );
        assert_eq!(
            config.transcoder.output_transport,
            OutputTransportKind::DirectPipe
        );
        assert_eq!(config.prebuffer.retention_window, Duration::from_millis(4000));
        assert_eq!(config.transcoder.quit_grace, Duration::from_millis(500));

        // Cleanup
        unsafe {
            std::env::remove_var("CAMREC_FFMPEG_PATH");
            std::env::remove_var("CAMREC_OUTPUT_TRANSPORT");
            std::env::remove_var("CAMREC_PREBUFFER_MS");
            std::env::remove_var("CAMREC_QUIT_GRACE_MS");
        }
    }
}
