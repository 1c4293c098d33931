//! Transcoder process lifecycle
//!
//! A `ProcessTransport` owns one external transcoder: it spawns the process,
//! wires its output either through a loopback listener or straight from
//! stdout, forwards stderr to the logs, and runs the quit → terminate → kill
//! stop sequence.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use super::loopback::{bind_ephemeral_listener, loopback_address};
use crate::config::{OutputTransportKind, TranscoderConfig};

/// Byte stream produced by a transcoder.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Directive that asks the transcoder to finish and exit.
pub const QUIT_DIRECTIVE: &[u8] = b"q";

/// Destination argument for the direct-pipe transport.
pub const STDOUT_DESTINATION: &str = "pipe:1";

/// Errors that can occur while running a transcoder
#[derive(Debug, Error)]
pub enum TransportError {
    /// Process could not be spawned
    #[error("Failed to start transcoder '{executable}': {source}")]
    SpawnFailed {
        /// Binary that failed to start
        executable: String,
        /// Underlying spawn error
        #[source]
        source: io::Error,
    },

    /// No loopback port could be bound
    #[error("Failed to bind loopback listener after {attempts} attempts: {source}")]
    BindFailed {
        /// Number of ports tried
        attempts: u32,
        /// Error from the last attempt
        #[source]
        source: io::Error,
    },

    /// Transcoder never connected to its listener
    #[error("Transcoder did not connect within {timeout:?}")]
    ConnectTimeout {
        /// How long we waited
        timeout: Duration,
    },

    /// A requested stdio pipe was not available after spawn
    #[error("Transcoder {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// Underlying I/O operation failed
    #[error("Transcoder I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle state of a transcoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Process is being spawned
    Starting,
    /// Process is running
    Running,
    /// Stop sequence in progress
    Stopping,
    /// Process has exited
    Stopped,
}

/// How a transcoder exit should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClassification {
    /// Exit code 0
    Clean,
    /// No exit code (signal) or a code the transcoder uses for "input ended"
    ExpectedAbnormal { code: Option<i32> },
    /// Any other non-zero exit code
    UnexpectedAbnormal { code: i32 },
}

impl ExitClassification {
    /// Classifies an exit code against the configured expected codes.
    pub fn classify(code: Option<i32>, expected_abnormal_codes: &[i32]) -> Self {
        match code {
            Some(0) => ExitClassification::Clean,
            Some(code) if expected_abnormal_codes.contains(&code) => {
                ExitClassification::ExpectedAbnormal { code: Some(code) }
            }
            Some(code) => ExitClassification::UnexpectedAbnormal { code },
            None => ExitClassification::ExpectedAbnormal { code: None },
        }
    }

    /// Classifies a process exit status.
    pub fn from_status(status: ExitStatus, expected_abnormal_codes: &[i32]) -> Self {
        Self::classify(status.code(), expected_abnormal_codes)
    }

    /// True for anything other than a clean exit.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitClassification::Clean)
    }
}

impl fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClassification::Clean => write!(f, "clean exit"),
            ExitClassification::ExpectedAbnormal { code: Some(code) } => {
                write!(f, "expected abnormal exit (code {code})")
            }
            ExitClassification::ExpectedAbnormal { code: None } => {
                write!(f, "expected abnormal exit (terminated by signal)")
            }
            ExitClassification::UnexpectedAbnormal { code } => {
                write!(f, "unexpected abnormal exit (code {code})")
            }
        }
    }
}

/// Outcome of stopping a transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Classified exit
    pub classification: ExitClassification,
    /// False when the process had already exited on its own
    pub requested: bool,
}

/// Where a transcoder's output can be read from
pub enum OutputEndpoint {
    /// Already-readable stream (stdout or an in-memory source)
    Stream(ByteSource),
    /// Listener the transcoder will connect to
    Loopback {
        /// Bound listener
        listener: TcpListener,
        /// Address handed to the transcoder
        address: String,
    },
}

impl fmt::Debug for OutputEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputEndpoint::Stream(_) => write!(f, "OutputEndpoint::Stream"),
            OutputEndpoint::Loopback { address, .. } => {
                write!(f, "OutputEndpoint::Loopback({address})")
            }
        }
    }
}

impl OutputEndpoint {
    /// Waits until the output is readable.
    ///
    /// For a loopback endpoint the first inbound connection is accepted and
    /// the listener is closed.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectTimeout` - Nobody connected within `timeout`
    /// - `TransportError::Io` - Accept failed
    pub async fn connect(self, timeout: Duration) -> TransportResult<ByteSource> {
        match self {
            OutputEndpoint::Stream(source) => Ok(source),
            OutputEndpoint::Loopback { listener, address } => {
                let (stream, peer) = tokio::time::timeout(timeout, listener.accept())
                    .await
                    .map_err(|_| TransportError::ConnectTimeout { timeout })??;
                drop(listener);

                debug!("Transcoder connected to {} from {}", address, peer);
                Ok(Box::new(stream))
            }
        }
    }
}

/// Grace periods and exit policy for a transcoder
#[derive(Debug, Clone)]
pub struct StopPolicy {
    /// Wait after the quit directive
    pub quit_grace: Duration,
    /// Wait after the terminate signal
    pub terminate_grace: Duration,
    /// Exit codes treated as expected
    pub expected_abnormal_codes: Vec<i32>,
}

impl From<&TranscoderConfig> for StopPolicy {
    fn from(config: &TranscoderConfig) -> Self {
        Self {
            quit_grace: config.quit_grace,
            terminate_grace: config.terminate_grace,
            expected_abnormal_codes: config.expected_abnormal_codes.clone(),
        }
    }
}

/// One running transcoder process
pub struct ProcessTransport {
    label: String,
    child: Child,
    pid: Option<u32>,
    control: Option<ChildStdin>,
    output: Option<OutputEndpoint>,
    state: TransportState,
    exit: Option<ExitReport>,
    policy: StopPolicy,
}

impl ProcessTransport {
    /// Spawns `executable` with `args` and wires its output.
    ///
    /// The destination (`tcp://127.0.0.1:<port>` or `pipe:1`) is appended as
    /// the last argument. For the loopback transport the listener is bound
    /// before the process starts.
    ///
    /// # Errors
    ///
    /// - `TransportError::BindFailed` - No loopback port available
    /// - `TransportError::SpawnFailed` - Process could not be started
    /// - `TransportError::MissingPipe` - stdout was not captured
    pub async fn start(
        label: impl Into<String>,
        executable: &Path,
        mut args: Vec<String>,
        transport: OutputTransportKind,
        config: &TranscoderConfig,
    ) -> TransportResult<Self> {
        let label = label.into();
        let mut state = TransportState::Starting;
        debug!("[{}] Transport {:?}", label, state);

        let listener = match transport {
            OutputTransportKind::Loopback => {
                let (listener, port) =
                    bind_ephemeral_listener(&config.loopback_ports, config.bind_attempts).await?;
                let address = loopback_address(port);
                args.push(address.clone());
                Some((listener, address))
            }
            OutputTransportKind::DirectPipe => {
                args.push(STDOUT_DESTINATION.to_string());
                None
            }
        };

        let mut cmd = Command::new(executable);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.stdout(if listener.is_some() {
            Stdio::null()
        } else {
            Stdio::piped()
        });

        info!("[{}] Starting transcoder {}", label, executable.display());
        debug!("[{}] Transcoder arguments: {}", label, args.join(" "));

        let mut child = cmd.spawn().map_err(|source| TransportError::SpawnFailed {
            executable: executable.display().to_string(),
            source,
        })?;

        let control = child.stdin.take();
        let output = match listener {
            Some((listener, address)) => OutputEndpoint::Loopback { listener, address },
            None => {
                let stdout = child
                    .stdout
                    .take()
                    .ok_or(TransportError::MissingPipe("stdout"))?;
                OutputEndpoint::Stream(Box::new(stdout))
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let label = label.clone();
            tokio::spawn(async move {
                let mut reader = tokio::io::BufReader::new(stderr);
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            if !line.trim().is_empty() {
                                debug!("[{}] transcoder: {}", label, line.trim());
                            }
                        }
                        Err(e) => {
                            warn!("[{}] Error reading transcoder stderr: {}", label, e);
                            break;
                        }
                    }
                }
            });
        }

        state = TransportState::Running;
        let pid = child.id();
        debug!("[{}] Transport {:?} (pid {:?})", label, state, pid);

        Ok(Self {
            label,
            child,
            pid,
            control,
            output: Some(output),
            state,
            exit: None,
            policy: StopPolicy::from(config),
        })
    }

    /// Process id, if the process was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Takes the output endpoint; returns `None` on later calls.
    pub fn take_output(&mut self) -> Option<OutputEndpoint> {
        self.output.take()
    }

    /// Writes a directive to the process's control input.
    ///
    /// # Errors
    ///
    /// - `io::ErrorKind::BrokenPipe` - Control channel already closed
    pub async fn send_control(&mut self, directive: &[u8]) -> io::Result<()> {
        let Some(control) = self.control.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control channel closed",
            ));
        };
        control.write_all(directive).await?;
        control.flush().await
    }

    /// Stops the process: quit directive, terminate signal, then kill.
    ///
    /// Calling this again after the process has exited returns the first
    /// report without touching the process.
    pub async fn stop(&mut self) -> ExitReport {
        if let Some(report) = self.exit {
            return report;
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            return self.finish(status, false);
        }

        self.state = TransportState::Stopping;
        debug!("[{}] Transport {:?}", self.label, self.state);

        if self.control.is_some() {
            if let Err(e) = self.send_control(QUIT_DIRECTIVE).await {
                debug!("[{}] Quit directive not delivered: {}", self.label, e);
            }
            // Closing stdin lets a transcoder blocked on input see EOF.
            self.control = None;

            if let Some(status) = self.wait_for(self.policy.quit_grace).await {
                return self.finish(status, true);
            }
        }

        info!(
            "[{}] Transcoder still running after {:?}, terminating",
            self.label, self.policy.quit_grace
        );
        self.send_terminate();
        if let Some(status) = self.wait_for(self.policy.terminate_grace).await {
            return self.finish(status, true);
        }

        warn!(
            "[{}] Transcoder ignored terminate signal, killing",
            self.label
        );
        if let Err(e) = self.child.kill().await {
            warn!("[{}] Failed to kill transcoder: {}", self.label, e);
        }

        match self.child.wait().await {
            Ok(status) => self.finish(status, true),
            Err(e) => {
                warn!("[{}] Failed to reap transcoder: {}", self.label, e);
                self.record(ExitClassification::ExpectedAbnormal { code: None }, true)
            }
        }
    }

    async fn wait_for(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("[{}] Failed to wait for transcoder: {}", self.label, e);
                None
            }
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("[{}] SIGTERM to {} failed: {}", self.label, pid, e);
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("[{}] Terminate failed: {}", self.label, e);
        }
    }

    fn finish(&mut self, status: ExitStatus, requested: bool) -> ExitReport {
        let classification =
            ExitClassification::from_status(status, &self.policy.expected_abnormal_codes);
        self.record(classification, requested)
    }

    fn record(&mut self, classification: ExitClassification, requested: bool) -> ExitReport {
        self.state = TransportState::Stopped;
        self.control = None;

        let report = ExitReport {
            classification,
            requested,
        };
        self.exit = Some(report);

        if classification.is_abnormal() && !requested {
            warn!("[{}] Transcoder {}", self.label, classification);
        } else {
            debug!("[{}] Transcoder {}", self.label, classification);
        }

        report
    }
}

impl fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_exit_classification() {
        let expected = [255];

        assert_eq!(
            ExitClassification::classify(Some(0), &expected),
            ExitClassification::Clean
        );
        assert_eq!(
            ExitClassification::classify(Some(255), &expected),
            ExitClassification::ExpectedAbnormal { code: Some(255) }
        );
        assert_eq!(
            ExitClassification::classify(None, &expected),
            ExitClassification::ExpectedAbnormal { code: None }
        );
        assert_eq!(
            ExitClassification::classify(Some(1), &expected),
            ExitClassification::UnexpectedAbnormal { code: 1 }
        );
        assert_eq!(
            ExitClassification::classify(Some(255), &[]),
            ExitClassification::UnexpectedAbnormal { code: 255 }
        );
        assert!(!ExitClassification::Clean.is_abnormal());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let config = TranscoderConfig::default();
        let result = ProcessTransport::start(
            "missing",
            Path::new("/nonexistent/camrec-transcoder"),
            Vec::new(),
            OutputTransportKind::DirectPipe,
            &config,
        )
        .await;

        assert!(matches!(result, Err(TransportError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_loopback_endpoint_times_out_without_client() {
        let (listener, port) = bind_ephemeral_listener(&(20_000..=30_000), 8)
            .await
            .unwrap();
        let endpoint = OutputEndpoint::Loopback {
            listener,
            address: loopback_address(port),
        };

        let result = endpoint.connect(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::ConnectTimeout { .. })));
    }

    #[cfg(unix)]
    fn shell_config() -> TranscoderConfig {
        TranscoderConfig {
            quit_grace: Duration::from_millis(500),
            terminate_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    fn shell_args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string(), "camrec-test".to_string()]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_direct_pipe_reads_stdout_and_destination() {
        let config = shell_config();
        let mut transport = ProcessTransport::start(
            "pipe",
            Path::new("/bin/sh"),
            shell_args("printf '%s' \"$1\""),
            OutputTransportKind::DirectPipe,
            &config,
        )
        .await
        .unwrap();
        assert_eq!(transport.state(), TransportState::Running);

        let mut output = transport
            .take_output()
            .unwrap()
            .connect(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(transport.take_output().is_none());

        let mut received = String::new();
        output.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, STDOUT_DESTINATION);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quit_directive_stops_cooperative_process() {
        let config = shell_config();
        let mut transport = ProcessTransport::start(
            "quit",
            Path::new("/bin/sh"),
            shell_args("read line; exit 0"),
            OutputTransportKind::DirectPipe,
            &config,
        )
        .await
        .unwrap();

        let report = transport.stop().await;
        assert_eq!(report.classification, ExitClassification::Clean);
        assert!(report.requested);
        assert_eq!(transport.state(), TransportState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_signal_after_ignored_quit() {
        let config = shell_config();
        let mut transport = ProcessTransport::start(
            "stubborn",
            Path::new("/bin/sh"),
            shell_args("exec sleep 30"),
            OutputTransportKind::DirectPipe,
            &config,
        )
        .await
        .unwrap();

        let report = transport.stop().await;
        assert_eq!(
            report.classification,
            ExitClassification::ExpectedAbnormal { code: None }
        );
        assert!(report.requested);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_after_natural_exit_is_not_requested() {
        let config = shell_config();
        let mut transport = ProcessTransport::start(
            "exited",
            Path::new("/bin/sh"),
            shell_args("exit 3"),
            OutputTransportKind::DirectPipe,
            &config,
        )
        .await
        .unwrap();

        transport.child.wait().await.unwrap();
        let first = transport.stop().await;
        assert_eq!(
            first.classification,
            ExitClassification::UnexpectedAbnormal { code: 3 }
        );
        assert!(!first.requested);

        let second = transport.stop().await;
        assert_eq!(first, second);
    }
}
