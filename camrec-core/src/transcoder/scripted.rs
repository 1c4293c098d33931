//! Scripted transcoder for tests.
//!
//! `ScriptedLauncher` hands out in-memory processes whose output is one half
//! of a duplex pipe. The other half is delivered to the test as a
//! `ScriptedFeed`, so tests decide exactly which bytes the "transcoder"
//! produces and when its output ends.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::launcher::{LaunchRequest, TranscoderLauncher, TranscoderProcess};
use super::transport::{
    ExitClassification, ExitReport, OutputEndpoint, TransportError, TransportResult,
    TransportState,
};
use crate::mp4::{BoxType, DEFAULT_MAX_BOX_SIZE, Mp4Box};

const FEED_BUFFER_SIZE: usize = 256 * 1024;
const FEED_WAIT: Duration = Duration::from_secs(5);

/// Test-side end of a scripted transcoder
pub struct ScriptedFeed {
    /// Request the process was launched with
    pub request: LaunchRequest,
    writer: DuplexStream,
    stopped: CancellationToken,
}

impl ScriptedFeed {
    /// Writes raw bytes as transcoder output.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    /// Writes encoded boxes as transcoder output.
    pub async fn write_boxes(&mut self, boxes: &[Mp4Box]) -> io::Result<()> {
        self.writer.write_all(&encode_boxes(boxes)).await
    }

    /// True once the process has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Waits until the process is stopped.
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// Ends the output stream, as if the transcoder exited.
    pub fn finish(self) {
        drop(self.writer);
    }
}

/// In-memory transcoder process
pub struct ScriptedProcess {
    output: Option<OutputEndpoint>,
    state: TransportState,
    exit: Option<ExitReport>,
    stopped: CancellationToken,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl TranscoderProcess for ScriptedProcess {
    fn take_output(&mut self) -> Option<OutputEndpoint> {
        self.output.take()
    }

    async fn send_control(&mut self, _directive: &[u8]) -> io::Result<()> {
        if self.state == TransportState::Running {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted transcoder is stopped",
            ))
        }
    }

    fn state(&self) -> TransportState {
        self.state
    }

    async fn stop(&mut self) -> ExitReport {
        if let Some(report) = self.exit {
            return report;
        }

        self.state = TransportState::Stopped;
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.cancel();

        let report = ExitReport {
            classification: ExitClassification::Clean,
            requested: true,
        };
        self.exit = Some(report);
        report
    }
}

/// Launcher producing `ScriptedProcess`es
pub struct ScriptedLauncher {
    feeds_tx: mpsc::UnboundedSender<ScriptedFeed>,
    feeds_rx: Mutex<mpsc::UnboundedReceiver<ScriptedFeed>>,
    launches: AtomicUsize,
    stops: Arc<AtomicUsize>,
    fail_launches: AtomicBool,
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        let (feeds_tx, feeds_rx) = mpsc::unbounded_channel();
        Self {
            feeds_tx,
            feeds_rx: Mutex::new(feeds_rx),
            launches: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            fail_launches: AtomicBool::new(false),
        }
    }

    /// Makes subsequent launches fail with `SpawnFailed`.
    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Number of successful launches.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of processes stopped so far.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Waits for the feed of the next launched process.
    ///
    /// Returns `None` if nothing is launched within a few seconds.
    pub async fn next_feed(&self) -> Option<ScriptedFeed> {
        let mut feeds = self.feeds_rx.lock().await;
        tokio::time::timeout(FEED_WAIT, feeds.recv())
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl TranscoderLauncher for ScriptedLauncher {
    async fn start(&self, request: LaunchRequest) -> TransportResult<Box<dyn TranscoderProcess>> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(TransportError::SpawnFailed {
                executable: "scripted".into(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted launch failure"),
            });
        }

        let (reader, writer) = tokio::io::duplex(FEED_BUFFER_SIZE);
        let stopped = CancellationToken::new();

        self.launches.fetch_add(1, Ordering::SeqCst);
        let _ = self.feeds_tx.send(ScriptedFeed {
            request,
            writer,
            stopped: stopped.clone(),
        });

        Ok(Box::new(ScriptedProcess {
            output: Some(OutputEndpoint::Stream(Box::new(reader))),
            state: TransportState::Running,
            exit: None,
            stopped,
            stops: Arc::clone(&self.stops),
        }))
    }

    fn max_box_size(&self) -> usize {
        DEFAULT_MAX_BOX_SIZE
    }
}

/// `ftyp` and `moov` boxes of a synthetic stream.
pub fn init_segment() -> Vec<Mp4Box> {
    vec![
        Mp4Box::new(BoxType::FTYP, &b"isom\0\0\x02\0"[..]),
        Mp4Box::new(BoxType::MOOV, vec![0xAA; 24]),
    ]
}

/// One `moof`/`mdat` media unit tagged with `seq`.
pub fn media_unit(seq: u8) -> Vec<Mp4Box> {
    vec![
        Mp4Box::new(BoxType::MOOF, vec![seq; 12]),
        Mp4Box::new(BoxType::MDAT, vec![seq; 64]),
    ]
}

/// Concatenated wire encoding of `boxes`.
pub fn encode_boxes(boxes: &[Mp4Box]) -> Bytes {
    let mut buf = BytesMut::new();
    for mp4_box in boxes {
        mp4_box.write_to(&mut buf);
    }
    buf.freeze()
}
