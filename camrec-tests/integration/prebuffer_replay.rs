//! Recording sessions fed from the pre-record buffer over loopback

use std::sync::Arc;
use std::time::Duration;

use camrec_core::mp4::{BoxReader, BoxType, Mp4Box};
use camrec_core::prebuffer::{PreBuffer, PreBufferRegistry};
use camrec_core::recording::{CloseReason, RecordingConfiguration};
use camrec_core::transcoder::scripted::{ScriptedFeed, ScriptedLauncher, init_segment, media_unit};
use camrec_core::{CameraConfig, CamrecConfig};
use tokio::net::TcpStream;

use super::common::{configured_controller, init_test_tracing, next_packet, porch_camera};

fn prebuffered_camera() -> CameraConfig {
    CameraConfig {
        prebuffer_enabled: true,
        ..porch_camera()
    }
}

async fn wait_for_retained(buffer: &PreBuffer, count: usize) {
    for _ in 0..500 {
        if buffer.retained_len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pre-record buffer retained {} boxes", buffer.retained_len());
}

/// Connects to the replay input of a recording transcoder's arguments.
async fn connect_replay(feed: &ScriptedFeed) -> BoxReader<TcpStream> {
    let args = &feed.request.args;
    let input = args.iter().position(|a| a == "-i").unwrap();
    let address = args[input + 1].strip_prefix("tcp://").unwrap();
    BoxReader::new(TcpStream::connect(address).await.unwrap())
}

async fn read_boxes(reader: &mut BoxReader<TcpStream>, count: usize) -> Vec<Mp4Box> {
    let mut boxes = Vec::with_capacity(count);
    for _ in 0..count {
        let next = tokio::time::timeout(Duration::from_secs(5), reader.next_box())
            .await
            .unwrap()
            .unwrap();
        boxes.push(next);
    }
    boxes
}

#[tokio::test]
async fn test_recording_starts_from_buffered_history() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let config = CamrecConfig::for_testing();
    let registry = Arc::new(PreBufferRegistry::new(config.clone(), launcher.clone()));
    let camera = prebuffered_camera();

    let buffer = registry.get_or_create(&camera);
    buffer.ensure_started().await.unwrap();
    let mut prebuffer_feed = launcher.next_feed().await.unwrap();

    // An mdat whose moof came before the buffer started.
    let mut history = init_segment();
    history.push(Mp4Box::new(BoxType::MDAT, vec![0; 32]));
    for seq in 1..=3 {
        history.extend(media_unit(seq));
    }
    prebuffer_feed.write_boxes(&history).await.unwrap();
    wait_for_retained(&buffer, 7).await;

    let controller = configured_controller(
        camera,
        config,
        launcher.clone(),
        Some(Arc::clone(&registry)),
    );
    let mut stream = controller.open_recording_stream(1).await.unwrap();
    let mut recording_feed = launcher.next_feed().await.unwrap();
    assert_eq!(launcher.launches(), 2);

    let mut replay = connect_replay(&recording_feed).await;
    let mut received = read_boxes(&mut replay, 8).await;
    assert_eq!(received[..2], init_segment()[..]);
    assert_eq!(received[2].box_type, BoxType::MOOF);
    assert_eq!(received[2].payload[0], 1);

    prebuffer_feed.write_boxes(&media_unit(4)).await.unwrap();
    received.extend(read_boxes(&mut replay, 2).await);
    assert_eq!(received[8..], media_unit(4)[..]);

    // Stand in for the recording transcoder: pass the replay through.
    recording_feed.write_boxes(&received).await.unwrap();

    let init = next_packet(&mut stream).await.unwrap().unwrap();
    assert!(init.is_init_segment);
    for _ in 1..=4 {
        let media = next_packet(&mut stream).await.unwrap().unwrap();
        assert!(!media.is_init_segment);
    }

    assert!(
        controller
            .close_recording_stream(1, CloseReason::Normal)
            .await
    );
    assert!(!prebuffer_feed.is_stopped());

    registry.shutdown_all().await;
    assert!(prebuffer_feed.is_stopped());
}

#[tokio::test]
async fn test_replay_honours_requested_window() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let config = CamrecConfig::for_testing();
    let registry = Arc::new(PreBufferRegistry::new(config.clone(), launcher.clone()));
    let camera = prebuffered_camera();

    let buffer = registry.get_or_create(&camera);
    buffer.ensure_started().await.unwrap();
    let mut prebuffer_feed = launcher.next_feed().await.unwrap();

    let mut boxes = init_segment();
    boxes.extend(media_unit(1));
    prebuffer_feed.write_boxes(&boxes).await.unwrap();
    wait_for_retained(&buffer, 2).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let mut recent = media_unit(2);
    recent.extend(media_unit(3));
    prebuffer_feed.write_boxes(&recent).await.unwrap();
    wait_for_retained(&buffer, 6).await;

    let controller = configured_controller(camera, config, launcher.clone(), Some(registry));
    controller.apply_configuration(Some(RecordingConfiguration {
        prebuffer_length_ms: 800,
        ..RecordingConfiguration::default()
    }));
    let _stream = controller.open_recording_stream(1).await.unwrap();
    let recording_feed = launcher.next_feed().await.unwrap();

    let mut replay = connect_replay(&recording_feed).await;
    let received = read_boxes(&mut replay, 6).await;
    assert_eq!(received[..2], init_segment()[..]);
    assert_eq!(received[2..4], media_unit(2)[..]);
    assert_eq!(received[4..], media_unit(3)[..]);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_shared_buffer_serves_two_sessions() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let config = CamrecConfig::for_testing();
    let registry = Arc::new(PreBufferRegistry::new(config.clone(), launcher.clone()));
    let controller = configured_controller(
        prebuffered_camera(),
        config,
        launcher.clone(),
        Some(Arc::clone(&registry)),
    );

    let _first = controller.open_recording_stream(1).await.unwrap();
    let mut prebuffer_feed = launcher.next_feed().await.unwrap();
    let first_feed = launcher.next_feed().await.unwrap();
    let _second = controller.open_recording_stream(2).await.unwrap();
    let second_feed = launcher.next_feed().await.unwrap();

    // One buffer transcoder, two recording transcoders.
    assert_eq!(launcher.launches(), 3);
    assert!(prebuffer_feed.request.label.contains("prebuffer"));

    let mut first_replay = connect_replay(&first_feed).await;
    let mut second_replay = connect_replay(&second_feed).await;

    let mut boxes = init_segment();
    boxes.extend(media_unit(1));
    prebuffer_feed.write_boxes(&boxes).await.unwrap();

    assert_eq!(read_boxes(&mut first_replay, 4).await, boxes);
    assert_eq!(read_boxes(&mut second_replay, 4).await, boxes);

    controller.shutdown().await;
    assert!(prebuffer_feed.is_stopped());
}
