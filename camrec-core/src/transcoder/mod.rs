//! External transcoder integration
//!
//! The transcoder is an opaque, single-writer byte producer. `ProcessTransport`
//! owns the process and its output wiring; `TranscoderLauncher` and
//! `TranscoderProcess` are the seams the rest of the crate depends on, so
//! recording and pre-record logic run unchanged against a scripted source in
//! tests.
//!
//! # Lifecycle
//!
//! `Starting → Running → Stopping → Stopped`. Stopping sends the quit
//! directive on stdin, then a terminate signal, then kills the process, each
//! step after its own grace period.

pub mod args;
pub mod launcher;
pub mod loopback;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;
pub mod transport;

pub use args::{FRAGMENTED_MOVFLAGS, build_prebuffer_args, build_recording_args, replay_input_args};
pub use launcher::{FfmpegLauncher, LaunchRequest, TranscoderLauncher, TranscoderProcess};
pub use loopback::{bind_ephemeral_listener, loopback_address};
pub use transport::{
    ByteSource, ExitClassification, ExitReport, OutputEndpoint, ProcessTransport, QUIT_DIRECTIVE,
    STDOUT_DESTINATION, StopPolicy, TransportError, TransportResult, TransportState,
};
