//! Always-on pre-record buffer for one camera
//!
//! A dedicated transcoder copies the camera's video into a fragmented MP4
//! stream. Boxes are retained for a rolling window and fanned out live.
//! Recording sessions consume a replay over a loopback socket: the captured
//! initialization segment, then retained boxes within the requested window,
//! then live boxes as they arrive.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ring::{INIT_BOX_COUNT, Ingested, ReplaySnapshot, RetainedBoxes};
use crate::config::{CameraConfig, CamrecConfig, PreBufferConfig, TranscoderConfig};
use crate::mp4::{BoxReader, BoxType, Mp4Box};
use crate::transcoder::{
    LaunchRequest, OutputEndpoint, TranscoderLauncher, TranscoderProcess, TransportError,
    bind_ephemeral_listener, build_prebuffer_args, loopback_address, replay_input_args,
};

/// Errors from the pre-record buffer
#[derive(Debug, Error)]
pub enum PreBufferError {
    #[error("Pre-record buffer for '{camera}' has been shut down")]
    ShutDown { camera: String },

    #[error("No video source configured for camera '{camera}'")]
    NoVideoSource { camera: String },

    #[error("Pre-record transcoder for '{camera}' exposed no output")]
    OutputUnavailable { camera: String },

    #[error("Pre-record transcoder failed: {0}")]
    Transport(#[from] TransportError),
}

/// Where a recording transcoder reads a replay from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEndpoint {
    /// Transcoder-facing address, `tcp://127.0.0.1:<port>`
    pub address: String,
    pub port: u16,
}

impl ReplayEndpoint {
    /// Input tokens that make a transcoder read this replay.
    pub fn input_args(&self) -> Vec<String> {
        replay_input_args(&self.address)
    }
}

#[derive(Debug, Clone)]
struct LiveBox {
    mp4_box: Mp4Box,
    init: bool,
}

type SharedProcess = Arc<Mutex<Box<dyn TranscoderProcess>>>;

struct IngestHandle {
    task: JoinHandle<()>,
    process: SharedProcess,
}

/// State shared with ingestion and replay tasks
struct Shared {
    camera: String,
    retained: parking_lot::Mutex<RetainedBoxes>,
    live: broadcast::Sender<LiveBox>,
    shutdown: CancellationToken,
}

impl Shared {
    fn ingest(&self, mp4_box: Mp4Box) {
        // Retention and fan-out happen under one lock so a subscriber sees
        // each box exactly once, either in its snapshot or live.
        let mut retained = self.retained.lock();
        let init = retained.ingest(mp4_box.clone(), Instant::now()) == Ingested::Init;
        let _ = self.live.send(LiveBox { mp4_box, init });
    }

    fn subscribe(&self, window: Duration) -> (ReplaySnapshot, broadcast::Receiver<LiveBox>) {
        let now = Instant::now();
        let mut retained = self.retained.lock();
        retained.evict(now);
        (retained.replay_from(window, now), self.live.subscribe())
    }
}

/// Pre-record buffer for a single camera
pub struct PreBuffer {
    camera: CameraConfig,
    transcoder: TranscoderConfig,
    config: PreBufferConfig,
    launcher: Arc<dyn TranscoderLauncher>,
    shared: Arc<Shared>,
    ingest: Mutex<Option<IngestHandle>>,
}

impl PreBuffer {
    /// Creates an idle buffer. Nothing runs until `ensure_started`.
    pub fn new(
        camera: CameraConfig,
        config: &CamrecConfig,
        launcher: Arc<dyn TranscoderLauncher>,
    ) -> Self {
        let (live, _) = broadcast::channel(config.prebuffer.live_capacity.max(1));
        let shared = Arc::new(Shared {
            camera: camera.name.clone(),
            retained: parking_lot::Mutex::new(RetainedBoxes::new(
                config.prebuffer.retention_window,
            )),
            live,
            shutdown: CancellationToken::new(),
        });

        Self {
            camera,
            transcoder: config.transcoder.clone(),
            config: config.prebuffer.clone(),
            launcher,
            shared,
            ingest: Mutex::new(None),
        }
    }

    /// Camera this buffer belongs to.
    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// Starts the buffer's transcoder unless it is already running.
    ///
    /// A buffer whose transcoder exited is restarted and captures a fresh
    /// initialization segment.
    ///
    /// # Errors
    ///
    /// - `PreBufferError::ShutDown` - Buffer was shut down
    /// - `PreBufferError::NoVideoSource` - Camera has no source tokens
    /// - `PreBufferError::Transport` - Transcoder could not be started
    pub async fn ensure_started(&self) -> Result<(), PreBufferError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PreBufferError::ShutDown {
                camera: self.camera.name.clone(),
            });
        }

        let mut ingest = self.ingest.lock().await;
        if ingest
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
        {
            return Ok(());
        }

        let source = self.camera.source_tokens();
        if source.is_empty() {
            return Err(PreBufferError::NoVideoSource {
                camera: self.camera.name.clone(),
            });
        }

        if ingest.take().is_some() {
            info!("Restarting pre-record buffer for {}", self.camera.name);
        }

        let mut process = self
            .launcher
            .start(LaunchRequest {
                label: format!("{} prebuffer", self.camera.name),
                args: build_prebuffer_args(&self.camera, self.transcoder.debug),
                output: self.transcoder.output_transport,
            })
            .await?;

        let Some(endpoint) = process.take_output() else {
            process.stop().await;
            return Err(PreBufferError::OutputUnavailable {
                camera: self.camera.name.clone(),
            });
        };

        self.shared.retained.lock().begin_capture();

        let process: SharedProcess = Arc::new(Mutex::new(process));
        let task = tokio::spawn(run_ingest(
            Arc::clone(&self.shared),
            endpoint,
            Arc::clone(&process),
            self.transcoder.connect_timeout,
            self.launcher.max_box_size(),
        ));
        *ingest = Some(IngestHandle { task, process });

        info!("Pre-record buffer started for {}", self.camera.name);
        Ok(())
    }

    /// True while the buffer's transcoder output is being ingested.
    pub async fn is_running(&self) -> bool {
        self.ingest
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Number of retained media boxes.
    pub fn retained_len(&self) -> usize {
        self.shared.retained.lock().len()
    }

    /// True once the initialization segment has been captured.
    pub fn has_init(&self) -> bool {
        self.shared.retained.lock().has_init()
    }

    /// Opens a one-shot replay of the last `window` of video.
    ///
    /// The listener accepts a single consumer. It closes if nobody connects
    /// within the configured replay timeout.
    ///
    /// # Errors
    ///
    /// - `PreBufferError::ShutDown` - Buffer was shut down
    /// - `PreBufferError::Transport` - No loopback port could be bound
    pub async fn replay(&self, window: Duration) -> Result<ReplayEndpoint, PreBufferError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PreBufferError::ShutDown {
                camera: self.camera.name.clone(),
            });
        }

        let (listener, port) = bind_ephemeral_listener(
            &self.transcoder.loopback_ports,
            self.transcoder.bind_attempts,
        )
        .await?;
        let address = loopback_address(port);

        debug!(
            "Replaying {:?} of {} on {}",
            window, self.camera.name, address
        );
        tokio::spawn(serve_replay(
            Arc::clone(&self.shared),
            listener,
            window,
            self.config.replay_timeout,
        ));

        Ok(ReplayEndpoint { address, port })
    }

    /// Stops the transcoder and every replay. The buffer cannot be restarted.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let handle = self.ingest.lock().await.take();
        if let Some(handle) = handle {
            let report = handle.process.lock().await.stop().await;
            debug!(
                "Pre-record transcoder for {} stopped: {}",
                self.camera.name, report.classification
            );
            let _ = handle.task.await;
        }

        info!("Pre-record buffer for {} shut down", self.camera.name);
    }
}

impl Drop for PreBuffer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn run_ingest(
    shared: Arc<Shared>,
    endpoint: OutputEndpoint,
    process: SharedProcess,
    connect_timeout: Duration,
    max_box_size: usize,
) {
    let source = tokio::select! {
        _ = shared.shutdown.cancelled() => None,
        connected = endpoint.connect(connect_timeout) => match connected {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("Pre-record transcoder for {} never produced output: {}", shared.camera, e);
                None
            }
        },
    };

    if let Some(source) = source {
        let mut reader = BoxReader::with_max_payload(source, max_box_size);
        loop {
            let next = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                next = reader.next_box() => next,
            };

            match next {
                Ok(mp4_box) => shared.ingest(mp4_box),
                Err(e) if e.is_truncation() => {
                    info!("Pre-record stream for {} ended", shared.camera);
                    break;
                }
                Err(e) => {
                    warn!("Pre-record stream for {} failed: {}", shared.camera, e);
                    break;
                }
            }
        }
    }

    let report = process.lock().await.stop().await;
    debug!(
        "Pre-record transcoder for {} exited: {}",
        shared.camera, report.classification
    );
}

async fn serve_replay(
    shared: Arc<Shared>,
    listener: TcpListener,
    window: Duration,
    accept_timeout: Duration,
) {
    let accepted = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        accepted = tokio::time::timeout(accept_timeout, listener.accept()) => accepted,
    };
    drop(listener);

    let mut stream = match accepted {
        Ok(Ok((stream, peer))) => {
            debug!("Replay consumer for {} connected from {}", shared.camera, peer);
            stream
        }
        Ok(Err(e)) => {
            warn!("Replay accept for {} failed: {}", shared.camera, e);
            return;
        }
        Err(_) => {
            debug!(
                "No replay consumer for {} within {:?}",
                shared.camera, accept_timeout
            );
            return;
        }
    };

    let (snapshot, live) = shared.subscribe(window);
    match write_replay(&mut stream, snapshot, live, &shared.shutdown).await {
        Ok(()) => debug!("Replay for {} finished", shared.camera),
        Err(e) => debug!("Replay consumer for {} went away: {}", shared.camera, e),
    }
}

/// Writes a snapshot followed by live boxes until the consumer goes away.
///
/// Live media is skipped until a `moof` whenever the consumer would
/// otherwise start mid-unit, including after falling behind the live feed.
/// A new initialization segment means the buffer restarted, which ends the
/// replay.
async fn write_replay<W>(
    writer: &mut W,
    snapshot: ReplaySnapshot,
    mut live: broadcast::Receiver<LiveBox>,
    shutdown: &CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut init_written = snapshot.init.len();
    let mut need_unit_start = snapshot.need_unit_start;

    let mut buf = BytesMut::new();
    for mp4_box in snapshot.init.iter().chain(snapshot.boxes.iter()) {
        mp4_box.write_to(&mut buf);
    }
    writer.write_all(&buf).await?;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = live.recv() => event,
        };

        let live_box = match event {
            Ok(live_box) => live_box,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Replay consumer fell behind by {} boxes", skipped);
                need_unit_start = true;
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };

        if live_box.init {
            if init_written >= INIT_BOX_COUNT {
                return Ok(());
            }
            init_written += 1;
        } else if need_unit_start {
            if live_box.mp4_box.box_type != BoxType::MOOF {
                continue;
            }
            need_unit_start = false;
        }

        buf.clear();
        live_box.mp4_box.write_to(&mut buf);
        writer.write_all(&buf).await?;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;
    use crate::transcoder::scripted::{ScriptedLauncher, encode_boxes, init_segment, media_unit};

    fn camera() -> CameraConfig {
        CameraConfig {
            prebuffer_enabled: true,
            ..CameraConfig::new("Garage", "-i rtsp://garage/live")
        }
    }

    fn prebuffer(launcher: &Arc<ScriptedLauncher>) -> PreBuffer {
        let launcher: Arc<dyn TranscoderLauncher> = launcher.clone();
        PreBuffer::new(camera(), &CamrecConfig::for_testing(), launcher)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_replay_serves_init_then_window_then_live() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let buffer = prebuffer(&launcher);
        buffer.ensure_started().await.unwrap();

        let mut feed = launcher.next_feed().await.unwrap();
        assert!(feed.request.args.iter().any(|a| a == "copy"));

        let mut history = init_segment();
        for seq in 1..=3 {
            history.extend(media_unit(seq));
        }
        feed.write_boxes(&history).await.unwrap();
        wait_until(|| buffer.retained_len() == 6).await;

        let endpoint = buffer.replay(Duration::from_secs(10)).await.unwrap();
        assert_eq!(
            endpoint.input_args(),
            vec!["-f", "mp4", "-i", endpoint.address.as_str()]
        );
        let mut consumer = TcpStream::connect(("127.0.0.1", endpoint.port))
            .await
            .unwrap();

        feed.write_boxes(&media_unit(4)).await.unwrap();

        let mut expected = history.clone();
        expected.extend(media_unit(4));
        let expected = encode_boxes(&expected);
        let received = read_exactly(&mut consumer, expected.len()).await;
        assert_eq!(received, expected.to_vec());

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_replay_before_init_is_captured() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let buffer = prebuffer(&launcher);
        buffer.ensure_started().await.unwrap();
        let mut feed = launcher.next_feed().await.unwrap();

        let endpoint = buffer.replay(Duration::from_secs(10)).await.unwrap();
        let mut consumer = TcpStream::connect(("127.0.0.1", endpoint.port))
            .await
            .unwrap();

        let mut boxes = init_segment();
        boxes.extend(media_unit(1));
        feed.write_boxes(&boxes).await.unwrap();

        let expected = encode_boxes(&boxes);
        let received = read_exactly(&mut consumer, expected.len()).await;
        assert_eq!(received, expected.to_vec());

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_feed_replays_only_init() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let mut config = CamrecConfig::for_testing();
        config.prebuffer.retention_window = Duration::from_millis(100);
        let buffer = PreBuffer::new(camera(), &config, launcher.clone());
        buffer.ensure_started().await.unwrap();
        let mut feed = launcher.next_feed().await.unwrap();

        let mut boxes = init_segment();
        boxes.extend(media_unit(1));
        feed.write_boxes(&boxes).await.unwrap();
        wait_until(|| buffer.retained_len() == 2).await;

        // The feed stalls past the retention window.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let endpoint = buffer.replay(Duration::from_secs(10)).await.unwrap();
        let mut consumer = TcpStream::connect(("127.0.0.1", endpoint.port))
            .await
            .unwrap();

        let init = encode_boxes(&init_segment());
        let received = read_exactly(&mut consumer, init.len()).await;
        assert_eq!(received, init.to_vec());
        wait_until(|| buffer.retained_len() == 0).await;

        feed.write_boxes(&media_unit(2)).await.unwrap();
        let live = encode_boxes(&media_unit(2));
        let received = read_exactly(&mut consumer, live.len()).await;
        assert_eq!(received, live.to_vec());

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_started_is_idempotent() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let buffer = prebuffer(&launcher);

        buffer.ensure_started().await.unwrap();
        buffer.ensure_started().await.unwrap();

        assert_eq!(launcher.launches(), 1);
        assert!(buffer.is_running().await);
        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_restarts_after_transcoder_exit() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let buffer = prebuffer(&launcher);
        buffer.ensure_started().await.unwrap();

        let mut feed = launcher.next_feed().await.unwrap();
        feed.write_boxes(&init_segment()).await.unwrap();
        wait_until(|| buffer.has_init()).await;
        feed.finish();

        for _ in 0..500 {
            if !buffer.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!buffer.is_running().await);
        assert_eq!(launcher.stops(), 1);

        buffer.ensure_started().await.unwrap();
        assert_eq!(launcher.launches(), 2);
        assert!(!buffer.has_init());

        buffer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_transcoder_and_refuses_restart() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let buffer = prebuffer(&launcher);
        buffer.ensure_started().await.unwrap();
        let feed = launcher.next_feed().await.unwrap();

        buffer.shutdown().await;

        assert!(feed.is_stopped());
        assert_eq!(launcher.stops(), 1);
        assert!(matches!(
            buffer.ensure_started().await,
            Err(PreBufferError::ShutDown { .. })
        ));
        assert!(matches!(
            buffer.replay(Duration::from_secs(1)).await,
            Err(PreBufferError::ShutDown { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_source_is_rejected() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let dyn_launcher: Arc<dyn TranscoderLauncher> = launcher.clone();
        let buffer = PreBuffer::new(
            CameraConfig::new("Blank", "  "),
            &CamrecConfig::for_testing(),
            dyn_launcher,
        );

        assert!(matches!(
            buffer.ensure_started().await,
            Err(PreBufferError::NoVideoSource { .. })
        ));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_replay_listener_closes_without_consumer() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let dyn_launcher: Arc<dyn TranscoderLauncher> = launcher.clone();
        let mut config = CamrecConfig::for_testing();
        config.prebuffer.replay_timeout = Duration::from_millis(100);
        let buffer = PreBuffer::new(camera(), &config, dyn_launcher);

        let endpoint = buffer.replay(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(
            TcpStream::connect(("127.0.0.1", endpoint.port))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_lagging_consumer_resumes_at_unit_start() {
        let (live, receiver) = broadcast::channel(4);
        let media = |box_type, tag: u8| LiveBox {
            mp4_box: Mp4Box::new(box_type, vec![tag]),
            init: false,
        };

        // Capacity 4 keeps only the last four: mdat 2, mdat 2, moof 3, mdat 3.
        for event in [
            media(BoxType::MOOF, 1),
            media(BoxType::MDAT, 1),
            media(BoxType::MOOF, 2),
            media(BoxType::MDAT, 2),
            media(BoxType::MDAT, 2),
            media(BoxType::MOOF, 3),
            media(BoxType::MDAT, 3),
        ] {
            live.send(event).unwrap();
        }
        drop(live);

        let snapshot = ReplaySnapshot {
            init: init_segment(),
            boxes: Vec::new(),
            need_unit_start: false,
        };
        let mut output = Vec::new();
        write_replay(&mut output, snapshot, receiver, &CancellationToken::new())
            .await
            .unwrap();

        let mut expected = init_segment();
        expected.push(Mp4Box::new(BoxType::MOOF, vec![3]));
        expected.push(Mp4Box::new(BoxType::MDAT, vec![3]));
        assert_eq!(output, encode_boxes(&expected).to_vec());
    }

    #[tokio::test]
    async fn test_new_init_segment_ends_replay() {
        let (live, receiver) = broadcast::channel(8);
        let ftyp = init_segment().remove(0);
        live.send(LiveBox {
            mp4_box: ftyp,
            init: true,
        })
        .unwrap();
        live.send(LiveBox {
            mp4_box: Mp4Box::new(BoxType::MOOF, vec![9]),
            init: false,
        })
        .unwrap();

        let mut snapshot = ReplaySnapshot {
            init: init_segment(),
            ..Default::default()
        };
        snapshot.boxes.extend(media_unit(1));

        let mut output = Vec::new();
        write_replay(&mut output, snapshot, receiver, &CancellationToken::new())
            .await
            .unwrap();

        let mut expected = init_segment();
        expected.extend(media_unit(1));
        assert_eq!(output, encode_boxes(&expected).to_vec());
        drop(live);
    }
}
