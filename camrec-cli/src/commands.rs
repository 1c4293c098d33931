//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use camrec_core::config::{CameraConfig, CamrecConfig, OutputTransportKind};
use camrec_core::recording::{CloseReason, RecordingConfiguration, SessionController, StreamId};
use camrec_core::tracing_setup::CliLogLevel;
use camrec_core::transcoder::{FfmpegLauncher, STDOUT_DESTINATION, TranscoderLauncher, build_recording_args};
use camrec_core::{CamrecError, PreBufferRegistry};
use clap::{Args, Subcommand};
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Camera and transcoder options shared by commands
#[derive(Args, Debug, Clone)]
pub struct CameraArgs {
    /// Transcoder input tokens, e.g. "-rtsp_transport tcp -i rtsp://cam/live"
    #[arg(long, allow_hyphen_values = true)]
    pub source: String,
    /// Camera name used in logs
    #[arg(long, default_value = "camera")]
    pub name: String,
    /// Recording configuration as JSON
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Keep a pre-record buffer and start the recording from it
    #[arg(long)]
    pub prebuffer: bool,
    /// Replace camera audio with a silent track
    #[arg(long)]
    pub no_audio: bool,
    /// Read transcoder output from its stdout instead of a loopback socket
    #[arg(long)]
    pub pipe: bool,
    /// Transcoder binary
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Record a camera into a fragmented MP4 file
    Record {
        #[command(flatten)]
        camera: CameraArgs,
        /// Recording stream id
        #[arg(long, default_value = "1")]
        stream_id: StreamId,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Seconds to let the pre-record buffer fill before recording
        #[arg(long, default_value = "0")]
        warmup: u64,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the transcoder command line a recording would use
    Args {
        #[command(flatten)]
        camera: CameraArgs,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first failure of the selected command
pub async fn handle_command(command: Commands, log_level: CliLogLevel) -> anyhow::Result<()> {
    match command {
        Commands::Record {
            camera,
            stream_id,
            duration,
            warmup,
            output,
        } => {
            record(
                camera,
                stream_id,
                duration.map(Duration::from_secs),
                Duration::from_secs(warmup),
                &output,
                log_level,
            )
            .await
        }
        Commands::Args { camera } => print_args(camera, log_level).await,
    }
}

fn build_config(args: &CameraArgs, log_level: CliLogLevel) -> CamrecConfig {
    let mut config = CamrecConfig::from_env();
    if args.pipe {
        config.transcoder.output_transport = OutputTransportKind::DirectPipe;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.transcoder.executable = ffmpeg.clone();
    }
    if log_level.wants_transcoder_output() {
        config.transcoder.debug = true;
    }
    config
}

fn camera_config(args: &CameraArgs) -> CameraConfig {
    CameraConfig {
        audio_enabled: !args.no_audio,
        prebuffer_enabled: args.prebuffer,
        ..CameraConfig::new(args.name.clone(), args.source.clone())
    }
}

/// Reads a recording configuration, or the default without a path.
///
/// # Errors
/// - File cannot be read or is not a valid configuration
pub async fn load_recording_config(path: Option<&Path>) -> anyhow::Result<RecordingConfiguration> {
    let Some(path) = path else {
        return Ok(RecordingConfiguration::default());
    };

    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading recording configuration {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing recording configuration {}", path.display()))
}

async fn print_args(args: CameraArgs, log_level: CliLogLevel) -> anyhow::Result<()> {
    let config = build_config(&args, log_level);
    let camera = camera_config(&args);
    let recording = load_recording_config(args.config.as_deref()).await?;

    let mut command = vec![config.transcoder.executable.display().to_string()];
    command.extend(build_recording_args(
        &camera,
        &camera.source_tokens(),
        &recording,
        config.transcoder.debug,
    ));
    command.push(match config.transcoder.output_transport {
        OutputTransportKind::Loopback => "tcp://127.0.0.1:<port>".to_string(),
        OutputTransportKind::DirectPipe => STDOUT_DESTINATION.to_string(),
    });

    println!("{}", command.join(" "));
    Ok(())
}

/// Record until the duration elapses, the transcoder ends, or Ctrl-C.
///
/// # Errors
/// - Recording could not be opened or failed mid-stream
/// - Output file could not be written
pub async fn record(
    args: CameraArgs,
    stream_id: StreamId,
    duration: Option<Duration>,
    warmup: Duration,
    output: &Path,
    log_level: CliLogLevel,
) -> anyhow::Result<()> {
    let config = build_config(&args, log_level);
    let camera = camera_config(&args);
    let recording = load_recording_config(args.config.as_deref()).await?;

    let launcher: Arc<dyn TranscoderLauncher> =
        Arc::new(FfmpegLauncher::new(config.transcoder.clone()));
    let registry = args
        .prebuffer
        .then(|| Arc::new(PreBufferRegistry::new(config.clone(), Arc::clone(&launcher))));

    if let Some(registry) = &registry
        && !warmup.is_zero()
    {
        match registry.get_or_create(&camera).ensure_started().await {
            Ok(()) => {
                println!("Filling pre-record buffer for {}s...", warmup.as_secs());
                tokio::time::sleep(warmup).await;
            }
            Err(e) => warn!("Pre-record buffer did not start: {}", e),
        }
    }

    let controller = SessionController::new(camera, config, launcher, registry.clone());
    controller.apply_configuration(Some(recording));

    let mut stream = controller
        .open_recording_stream(stream_id)
        .await
        .map_err(|e| {
            let error = CamrecError::from(e);
            let message = error.user_message();
            anyhow::Error::new(error).context(message)
        })?;

    let mut file = fs::File::create(output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;
    println!("Recording stream {stream_id} to {}", output.display());

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut fragments = 0u64;
    let mut bytes = 0u64;
    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing recording stream {}", stream_id);
                controller.close_recording_stream(stream_id, CloseReason::Normal).await;
                break Ok(());
            }
            _ = &mut deadline => {
                info!("Recording duration reached");
                controller.close_recording_stream(stream_id, CloseReason::Normal).await;
                break Ok(());
            }
            packet = stream.next() => match packet {
                Some(Ok(packet)) if packet.is_last => break Ok(()),
                Some(Ok(packet)) => {
                    if let Err(e) = file.write_all(&packet.data).await {
                        controller
                            .close_recording_stream(stream_id, CloseReason::StorageFull)
                            .await;
                        break Err(anyhow::Error::new(e).context("writing recording"));
                    }
                    fragments += 1;
                    bytes += packet.data.len() as u64;
                }
                Some(Err(e)) => break Err(anyhow::Error::new(e).context("recording stream failed")),
                None => break Ok(()),
            },
        }
    };

    controller.shutdown().await;
    if let Some(registry) = registry {
        registry.shutdown_all().await;
    }
    file.flush().await.context("flushing recording")?;
    outcome?;

    if fragments == 0 {
        bail!("transcoder produced no fragments");
    }
    println!(
        "Wrote {fragments} fragments ({:.2} MB) to {}",
        bytes as f64 / 1_048_576.0,
        output.display()
    );
    Ok(())
}
