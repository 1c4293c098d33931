//! Shared helpers for integration tests

use std::sync::Arc;
use std::time::Duration;

use camrec_core::prebuffer::PreBufferRegistry;
use camrec_core::recording::{
    RecordingConfiguration, RecordingPacket, RecordingResult, RecordingStream, SessionController,
};
use camrec_core::transcoder::TranscoderLauncher;
use camrec_core::{CameraConfig, CamrecConfig};
use futures::StreamExt;

/// Routes test logs through the test harness's captured output.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("camrec_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn porch_camera() -> CameraConfig {
    CameraConfig::new("Porch", "-rtsp_transport tcp -i rtsp://porch/live")
}

/// Controller with the default recording configuration applied.
pub fn configured_controller(
    camera: CameraConfig,
    config: CamrecConfig,
    launcher: Arc<dyn TranscoderLauncher>,
    prebuffers: Option<Arc<PreBufferRegistry>>,
) -> SessionController {
    let controller = SessionController::new(camera, config, launcher, prebuffers);
    controller.apply_configuration(Some(RecordingConfiguration::default()));
    controller
}

/// Next packet, failing the test if nothing arrives within five seconds.
pub async fn next_packet(stream: &mut RecordingStream) -> Option<RecordingResult<RecordingPacket>> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("recording stream stalled")
}
