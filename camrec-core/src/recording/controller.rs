//! Recording session orchestration
//!
//! One `SessionController` serves one camera. Each open stream id owns an
//! independent transcoder, cancellation token and fragment producer; the
//! camera's pre-record buffer is shared through the registry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stream::{RecordingStream, SessionContext};
use super::types::{CloseReason, RecordingConfiguration, RecordingError, RecordingResult, StreamId};
use crate::config::{CameraConfig, CamrecConfig};
use crate::prebuffer::PreBufferRegistry;
use crate::transcoder::{
    ExitClassification, LaunchRequest, TranscoderLauncher, TranscoderProcess, TransportError,
    build_recording_args,
};

/// Bookkeeping for one open recording stream
pub(crate) struct SessionEntry {
    session_id: u64,
    cancel: CancellationToken,
    closed_externally: Arc<AtomicBool>,
    process: Box<dyn TranscoderProcess>,
    opened_at: Instant,
}

/// Open sessions of one camera, keyed by stream id
///
/// Whoever removes an entry stops its transcoder, so every session is torn
/// down exactly once.
pub(crate) struct SessionTable {
    camera: String,
    entries: parking_lot::Mutex<HashMap<StreamId, SessionEntry>>,
}

impl SessionTable {
    fn new(camera: String) -> Self {
        Self {
            camera,
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn contains(&self, stream_id: StreamId) -> bool {
        self.entries.lock().contains_key(&stream_id)
    }

    /// True while `session_id` is the open session for `stream_id`.
    pub(crate) fn holds(&self, stream_id: StreamId, session_id: u64) -> bool {
        self.entries
            .lock()
            .get(&stream_id)
            .is_some_and(|entry| entry.session_id == session_id)
    }

    fn insert(&self, stream_id: StreamId, entry: SessionEntry) -> Result<(), SessionEntry> {
        match self.entries.lock().entry(stream_id) {
            Entry::Occupied(_) => Err(entry),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Removes a session closed by the host. The entry is marked before it
    /// leaves the table, so its producer never reports a natural end.
    fn take(&self, stream_id: StreamId) -> Option<SessionEntry> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&stream_id) {
            entry.closed_externally.store(true, Ordering::SeqCst);
        }
        entries.remove(&stream_id)
    }

    fn drain(&self) -> Vec<(StreamId, SessionEntry)> {
        let mut entries = self.entries.lock();
        for entry in entries.values() {
            entry.closed_externally.store(true, Ordering::SeqCst);
        }
        entries.drain().collect()
    }

    fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.entries.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stops `session_id` if it is still the open session for `stream_id`.
    pub(crate) async fn release(&self, stream_id: StreamId, session_id: u64) {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(&stream_id) {
                Some(entry) if entry.session_id == session_id => entries.remove(&stream_id),
                _ => None,
            }
        };

        if let Some(entry) = entry {
            stop_session(&self.camera, stream_id, entry).await;
        }
    }
}

async fn stop_session(camera: &str, stream_id: StreamId, mut entry: SessionEntry) {
    entry.cancel.cancel();
    let report = entry.process.stop().await;
    let elapsed = entry.opened_at.elapsed();

    match report.classification {
        ExitClassification::Clean => {
            debug!(
                "Recording stream {} of {} stopped cleanly after {:?}",
                stream_id, camera, elapsed
            );
        }
        classification if report.requested => {
            debug!(
                "Recording stream {} of {} stopped on request: {}",
                stream_id, camera, classification
            );
        }
        ExitClassification::ExpectedAbnormal { .. } => {
            warn!(
                "Recording transcoder for stream {} of {} ended abnormally (input ended): {}",
                stream_id, camera, report.classification
            );
        }
        ExitClassification::UnexpectedAbnormal { .. } => {
            warn!(
                "Recording transcoder for stream {} of {} failed: {}",
                stream_id, camera, report.classification
            );
        }
    }
}

/// Recording sessions of one camera
pub struct SessionController {
    camera: CameraConfig,
    config: CamrecConfig,
    launcher: Arc<dyn TranscoderLauncher>,
    prebuffers: Option<Arc<PreBufferRegistry>>,
    recording: parking_lot::RwLock<Option<RecordingConfiguration>>,
    sessions: Arc<SessionTable>,
    next_session_id: AtomicU64,
}

impl SessionController {
    /// Creates a controller. Pass a registry to enable pre-record buffering
    /// for cameras that ask for it.
    pub fn new(
        camera: CameraConfig,
        config: CamrecConfig,
        launcher: Arc<dyn TranscoderLauncher>,
        prebuffers: Option<Arc<PreBufferRegistry>>,
    ) -> Self {
        let sessions = Arc::new(SessionTable::new(camera.name.clone()));
        Self {
            camera,
            config,
            launcher,
            prebuffers,
            recording: parking_lot::RwLock::new(None),
            sessions,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// Replaces the recording configuration used by future sessions.
    ///
    /// `None` clears it; open sessions are not affected either way.
    pub fn apply_configuration(&self, configuration: Option<RecordingConfiguration>) {
        match &configuration {
            Some(config) => debug!(
                "Recording configuration for {}: {}x{}@{} {}k",
                self.camera.name,
                config.video.width,
                config.video.height,
                config.video.fps,
                config.video.bitrate_kbps
            ),
            None => debug!("Recording configuration for {} cleared", self.camera.name),
        }
        *self.recording.write() = configuration;
    }

    /// Currently applied recording configuration.
    pub fn configuration(&self) -> Option<RecordingConfiguration> {
        self.recording.read().clone()
    }

    /// Stream ids with an open session.
    pub fn active_streams(&self) -> Vec<StreamId> {
        self.sessions.ids()
    }

    /// Opens a recording session and returns its fragment producer.
    ///
    /// With pre-record buffering enabled the transcoder reads a replay of
    /// the buffer, so the first fragments start before this call. A buffer
    /// that cannot start is logged and the live source is used instead.
    ///
    /// # Errors
    ///
    /// - `RecordingError::NoConfiguration` - No configuration applied
    /// - `RecordingError::NoVideoSource` - Camera source is empty
    /// - `RecordingError::StreamAlreadyOpen` - `stream_id` is already recording
    /// - `RecordingError::ProcessSpawnFailure` - Transcoder could not be started
    pub async fn open_recording_stream(
        &self,
        stream_id: StreamId,
    ) -> RecordingResult<RecordingStream> {
        let Some(recording) = self.configuration() else {
            return Err(RecordingError::NoConfiguration {
                camera: self.camera.name.clone(),
            });
        };

        let source = self.camera.source_tokens();
        if source.is_empty() {
            return Err(RecordingError::NoVideoSource {
                camera: self.camera.name.clone(),
            });
        }

        if self.sessions.contains(stream_id) {
            return Err(RecordingError::StreamAlreadyOpen { stream_id });
        }

        let input = self.recording_input(source, &recording).await;
        let args = build_recording_args(
            &self.camera,
            &input,
            &recording,
            self.config.transcoder.debug,
        );

        let mut process = self
            .launcher
            .start(LaunchRequest {
                label: format!("{} stream {}", self.camera.name, stream_id),
                args,
                output: self.config.transcoder.output_transport,
            })
            .await
            .map_err(RecordingError::ProcessSpawnFailure)?;

        let Some(endpoint) = process.take_output() else {
            process.stop().await;
            return Err(RecordingError::ProcessSpawnFailure(
                TransportError::MissingPipe("output"),
            ));
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let closed_externally = Arc::new(AtomicBool::new(false));

        let entry = SessionEntry {
            session_id,
            cancel: cancel.clone(),
            closed_externally: Arc::clone(&closed_externally),
            process,
            opened_at: Instant::now(),
        };
        if let Err(mut rejected) = self.sessions.insert(stream_id, entry) {
            rejected.process.stop().await;
            return Err(RecordingError::StreamAlreadyOpen { stream_id });
        }

        info!(
            "Recording stream {} of {} opened (session {})",
            stream_id, self.camera.name, session_id
        );

        let ctx = SessionContext {
            stream_id,
            session_id,
            camera: self.camera.name.clone(),
            connect_timeout: self.config.transcoder.connect_timeout,
            max_box_size: self.launcher.max_box_size(),
            cancel,
            closed_externally,
            sessions: Arc::clone(&self.sessions),
        };
        Ok(RecordingStream::new(ctx, endpoint))
    }

    async fn recording_input(
        &self,
        source: Vec<String>,
        recording: &RecordingConfiguration,
    ) -> Vec<String> {
        if !self.camera.prebuffer_enabled {
            return source;
        }
        let Some(registry) = &self.prebuffers else {
            return source;
        };

        let buffer = registry.get_or_create(&self.camera);
        if let Err(e) = buffer.ensure_started().await {
            warn!(
                "Pre-record buffer for {} unavailable, recording live source: {}",
                self.camera.name, e
            );
            return source;
        }

        let window = Duration::from_millis(recording.prebuffer_length_ms);
        match buffer.replay(window).await {
            Ok(endpoint) => endpoint.input_args(),
            Err(e) => {
                warn!(
                    "Pre-record replay for {} failed, recording live source: {}",
                    self.camera.name, e
                );
                source
            }
        }
    }

    /// Closes a recording session.
    ///
    /// The producer stops at its next suspension point without emitting a
    /// terminal packet. `reason` is only logged. Returns `false` when no
    /// session was open for `stream_id`.
    pub async fn close_recording_stream(&self, stream_id: StreamId, reason: CloseReason) -> bool {
        let Some(entry) = self.sessions.take(stream_id) else {
            debug!(
                "Recording stream {} of {} already closed",
                stream_id, self.camera.name
            );
            return false;
        };

        if reason.is_normal() {
            info!(
                "Recording stream {} of {} closed: {}",
                stream_id, self.camera.name, reason
            );
        } else {
            warn!(
                "Recording stream {} of {} closed: {}",
                stream_id, self.camera.name, reason
            );
        }

        stop_session(&self.camera.name, stream_id, entry).await;
        true
    }

    /// Stops every open session and the camera's pre-record buffer.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.drain();
        if !sessions.is_empty() {
            info!(
                "Stopping {} recording sessions of {}",
                sessions.len(),
                self.camera.name
            );
        }

        for (stream_id, entry) in sessions {
            stop_session(&self.camera.name, stream_id, entry).await;
        }

        if let Some(buffer) = self
            .prebuffers
            .as_ref()
            .and_then(|registry| registry.get(&self.camera.name))
        {
            buffer.shutdown().await;
        }
    }
}
