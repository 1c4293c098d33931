//! Transcoder abstraction for both production and scripted modes

use std::io;

use async_trait::async_trait;

use super::transport::{
    ExitReport, OutputEndpoint, ProcessTransport, TransportResult, TransportState,
};
use crate::config::{OutputTransportKind, TranscoderConfig};

/// Control surface of one running transcoder
///
/// Session and pre-record buffer logic only talks to the transcoder through
/// this trait, so the same code drives a loopback socket, a stdout pipe or an
/// in-memory source.
#[async_trait]
pub trait TranscoderProcess: Send {
    /// Takes the output endpoint. Returns `None` once taken.
    fn take_output(&mut self) -> Option<OutputEndpoint>;

    /// Writes a directive to the process's control input.
    ///
    /// # Errors
    ///
    /// - `io::Error` - Control channel is closed or the write failed
    async fn send_control(&mut self, directive: &[u8]) -> io::Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Runs the graceful-then-forceful stop sequence.
    async fn stop(&mut self) -> ExitReport;
}

/// What to launch
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Name used in log lines
    pub label: String,
    /// Arguments without the output destination
    pub args: Vec<String>,
    /// How the output comes back
    pub output: OutputTransportKind,
}

/// Starts transcoder processes
#[async_trait]
pub trait TranscoderLauncher: Send + Sync {
    /// Starts a transcoder for `request`.
    ///
    /// # Errors
    ///
    /// - `TransportError::SpawnFailed` - Process could not be started
    /// - `TransportError::BindFailed` - No loopback port available
    async fn start(&self, request: LaunchRequest) -> TransportResult<Box<dyn TranscoderProcess>>;

    /// Largest box payload accepted from launched transcoders.
    fn max_box_size(&self) -> usize;
}

#[async_trait]
impl TranscoderProcess for ProcessTransport {
    fn take_output(&mut self) -> Option<OutputEndpoint> {
        ProcessTransport::take_output(self)
    }

    async fn send_control(&mut self, directive: &[u8]) -> io::Result<()> {
        ProcessTransport::send_control(self, directive).await
    }

    fn state(&self) -> TransportState {
        ProcessTransport::state(self)
    }

    async fn stop(&mut self) -> ExitReport {
        ProcessTransport::stop(self).await
    }
}

/// Production launcher spawning the configured transcoder binary
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    config: TranscoderConfig,
}

impl FfmpegLauncher {
    /// Creates a launcher for the configured executable.
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    /// Launcher configuration.
    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }
}

#[async_trait]
impl TranscoderLauncher for FfmpegLauncher {
    async fn start(&self, request: LaunchRequest) -> TransportResult<Box<dyn TranscoderProcess>> {
        let transport = ProcessTransport::start(
            request.label,
            &self.config.executable,
            request.args,
            request.output,
            &self.config,
        )
        .await?;

        Ok(Box::new(transport))
    }

    fn max_box_size(&self) -> usize {
        self.config.max_box_size
    }
}
