//! Camrec CLI - Command-line interface
//!
//! Records a camera through the fragmented MP4 pipeline into a local file.

mod commands;

use std::path::PathBuf;

use camrec_core::tracing_setup::{CliLogLevel, init_tracing};
use clap::Parser;

#[derive(Parser)]
#[command(name = "camrec")]
#[command(about = "Camera recording pipeline driven by an external transcoder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the per-run debug log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command, cli.log_level).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_record_flags_parse() {
        let cli = Cli::try_parse_from([
            "camrec",
            "--log-level",
            "debug",
            "record",
            "--source",
            "-i rtsp://porch/live",
            "--output",
            "porch.mp4",
            "--stream-id",
            "3",
            "--duration",
            "20",
            "--prebuffer",
            "--pipe",
        ])
        .unwrap();

        assert_eq!(cli.log_level, CliLogLevel::Debug);
        match cli.command {
            commands::Commands::Record {
                camera,
                stream_id,
                duration,
                output,
                ..
            } => {
                assert_eq!(camera.source, "-i rtsp://porch/live");
                assert!(camera.prebuffer);
                assert!(camera.pipe);
                assert_eq!(stream_id, 3);
                assert_eq!(duration, Some(20));
                assert_eq!(output, PathBuf::from("porch.mp4"));
            }
            _ => panic!("expected record command"),
        }
    }
}
