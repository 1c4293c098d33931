//! Recording sessions driving a real child process over a stdout pipe
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use camrec_core::CamrecConfig;
use camrec_core::config::OutputTransportKind;
use camrec_core::recording::{CloseReason, RecordingError, RecordingStream, SessionController};
use camrec_core::transcoder::scripted::{encode_boxes, init_segment, media_unit};
use camrec_core::transcoder::{FfmpegLauncher, TranscoderLauncher, TransportError};
use tempfile::TempDir;

use super::common::{configured_controller, init_test_tracing, next_packet, porch_camera};

/// Writes an executable stand-in transcoder that ignores its arguments.
fn fake_transcoder(dir: &TempDir, fixture: &[u8], body: &str) -> PathBuf {
    let fixture_path = dir.path().join("stream.mp4");
    std::fs::write(&fixture_path, fixture).unwrap();

    let script_path = dir.path().join("fake-ffmpeg");
    let script = format!(
        "#!/bin/sh\n{}\n",
        body.replace("$FIXTURE", &format!("'{}'", fixture_path.display()))
    );
    std::fs::write(&script_path, script).unwrap();
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    script_path
}

fn pipe_controller(executable: &Path) -> SessionController {
    let mut config = CamrecConfig::for_testing();
    config.transcoder.executable = executable.to_path_buf();
    config.transcoder.output_transport = OutputTransportKind::DirectPipe;

    let launcher: Arc<dyn TranscoderLauncher> =
        Arc::new(FfmpegLauncher::new(config.transcoder.clone()));
    configured_controller(porch_camera(), config, launcher, None)
}

/// Opens a stream, retrying while a freshly written script is still busy.
async fn open_with_retry(controller: &SessionController, stream_id: u32) -> RecordingStream {
    for attempt in 1..=5 {
        match controller.open_recording_stream(stream_id).await {
            Err(RecordingError::ProcessSpawnFailure(_)) if attempt < 5 => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            result => return result.unwrap(),
        }
    }
    unreachable!("retry loop always returns")
}

#[tokio::test]
async fn test_child_process_output_becomes_fragments() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut boxes = init_segment();
    boxes.extend(media_unit(1));
    boxes.extend(media_unit(2));
    let script = fake_transcoder(&dir, &encode_boxes(&boxes), "cat $FIXTURE");

    let controller = pipe_controller(&script);
    let mut stream = open_with_retry(&controller, 1).await;

    let init = next_packet(&mut stream).await.unwrap().unwrap();
    assert!(init.is_init_segment);
    assert_eq!(init.data, encode_boxes(&init_segment()));

    for seq in 1..=2 {
        let media = next_packet(&mut stream).await.unwrap().unwrap();
        assert_eq!(media.data, encode_boxes(&media_unit(seq)));
    }

    let last = next_packet(&mut stream).await.unwrap().unwrap();
    assert!(last.is_last);
    assert!(next_packet(&mut stream).await.is_none());
    assert!(controller.active_streams().is_empty());
}

#[tokio::test]
async fn test_close_stops_waiting_child() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let script = fake_transcoder(
        &dir,
        &encode_boxes(&init_segment()),
        "cat $FIXTURE\nread directive",
    );

    let controller = pipe_controller(&script);
    let mut stream = open_with_retry(&controller, 2).await;
    assert!(next_packet(&mut stream).await.unwrap().unwrap().is_init_segment);

    let closed = tokio::time::timeout(
        Duration::from_secs(5),
        controller.close_recording_stream(2, CloseReason::Normal),
    )
    .await
    .unwrap();

    assert!(closed);
    assert!(next_packet(&mut stream).await.is_none());
    assert!(controller.active_streams().is_empty());
}

#[tokio::test]
async fn test_missing_transcoder_fails_open() {
    init_test_tracing();
    let controller = pipe_controller(Path::new("/nonexistent/camrec-ffmpeg"));

    let result = controller.open_recording_stream(1).await;

    assert!(matches!(
        result,
        Err(RecordingError::ProcessSpawnFailure(TransportError::SpawnFailed { .. }))
    ));
    assert!(controller.active_streams().is_empty());
}
