//! Concurrent recording sessions against scripted transcoders

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use camrec_core::CamrecConfig;
use camrec_core::recording::{CloseReason, RecordingError, RecordingStream};
use camrec_core::transcoder::scripted::{ScriptedLauncher, encode_boxes, init_segment, media_unit};

use super::common::{configured_controller, init_test_tracing, next_packet, porch_camera};

/// Drains a stream into its concatenated packet data and the terminal flag.
async fn collect(mut stream: RecordingStream) -> (Vec<Bytes>, bool) {
    let mut packets = Vec::new();
    let mut saw_last = false;
    while let Some(packet) = next_packet(&mut stream).await {
        let packet = packet.unwrap();
        if packet.is_last {
            saw_last = true;
            continue;
        }
        packets.push(packet.data);
    }
    (packets, saw_last)
}

#[tokio::test]
async fn test_concurrent_sessions_produce_independently() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let controller = configured_controller(
        porch_camera(),
        CamrecConfig::for_testing(),
        launcher.clone(),
        None,
    );

    let first = controller.open_recording_stream(1).await.unwrap();
    let mut first_feed = launcher.next_feed().await.unwrap();
    let second = controller.open_recording_stream(2).await.unwrap();
    let mut second_feed = launcher.next_feed().await.unwrap();

    let first_task = tokio::spawn(collect(first));
    let second_task = tokio::spawn(collect(second));

    let mut first_boxes = init_segment();
    for seq in 1..=3 {
        first_boxes.extend(media_unit(seq));
    }
    let mut second_boxes = init_segment();
    for seq in 10..=11 {
        second_boxes.extend(media_unit(seq));
    }

    first_feed.write_boxes(&first_boxes).await.unwrap();
    second_feed.write_boxes(&second_boxes).await.unwrap();
    first_feed.finish();
    second_feed.finish();

    let (first_packets, first_last) = first_task.await.unwrap();
    let (second_packets, second_last) = second_task.await.unwrap();

    assert_eq!(first_packets.len(), 4);
    assert_eq!(second_packets.len(), 3);
    assert!(first_last && second_last);
    assert_eq!(first_packets[3], encode_boxes(&media_unit(3)));
    assert_eq!(second_packets[1], encode_boxes(&media_unit(10)));

    let joined: BytesMut = first_packets.iter().flat_map(|p| p.iter().copied()).collect();
    assert_eq!(joined.freeze(), encode_boxes(&first_boxes));
    assert!(controller.active_streams().is_empty());
}

#[tokio::test]
async fn test_closing_one_session_leaves_sibling_running() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let controller = configured_controller(
        porch_camera(),
        CamrecConfig::for_testing(),
        launcher.clone(),
        None,
    );

    let mut first = controller.open_recording_stream(1).await.unwrap();
    let mut first_feed = launcher.next_feed().await.unwrap();
    let mut second = controller.open_recording_stream(2).await.unwrap();
    let mut second_feed = launcher.next_feed().await.unwrap();

    first_feed.write_boxes(&init_segment()).await.unwrap();
    second_feed.write_boxes(&init_segment()).await.unwrap();
    assert!(next_packet(&mut first).await.unwrap().unwrap().is_init_segment);
    assert!(next_packet(&mut second).await.unwrap().unwrap().is_init_segment);

    assert!(
        controller
            .close_recording_stream(1, CloseReason::from_code(2))
            .await
    );
    assert!(
        !controller
            .close_recording_stream(1, CloseReason::Normal)
            .await
    );
    assert_eq!(launcher.stops(), 1);

    for seq in 1..=5 {
        second_feed.write_boxes(&media_unit(seq)).await.unwrap();
        let packet = next_packet(&mut second).await.unwrap().unwrap();
        assert_eq!(packet.data, encode_boxes(&media_unit(seq)));
    }

    assert!(next_packet(&mut first).await.is_none());
    assert_eq!(controller.active_streams(), vec![2]);

    controller.shutdown().await;
    assert!(second_feed.is_stopped());
    assert!(next_packet(&mut second).await.is_none());
    assert_eq!(launcher.stops(), 2);
}

#[tokio::test]
async fn test_failed_session_does_not_affect_sibling() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let controller = configured_controller(
        porch_camera(),
        CamrecConfig::for_testing(),
        launcher.clone(),
        None,
    );

    let mut broken = controller.open_recording_stream(1).await.unwrap();
    let mut broken_feed = launcher.next_feed().await.unwrap();
    let mut healthy = controller.open_recording_stream(2).await.unwrap();
    let mut healthy_feed = launcher.next_feed().await.unwrap();

    // A 2 GiB declared box is beyond the payload ceiling.
    broken_feed
        .write_bytes(&[0x80, 0, 0, 0, b'm', b'd', b'a', b't'])
        .await
        .unwrap();
    assert!(matches!(
        next_packet(&mut broken).await.unwrap(),
        Err(RecordingError::BoxStream(_))
    ));
    assert!(next_packet(&mut broken).await.is_none());

    let mut boxes = init_segment();
    boxes.extend(media_unit(1));
    healthy_feed.write_boxes(&boxes).await.unwrap();
    assert!(next_packet(&mut healthy).await.unwrap().unwrap().is_init_segment);
    assert!(!next_packet(&mut healthy).await.unwrap().unwrap().is_init_segment);
    assert_eq!(controller.active_streams(), vec![2]);
}

#[tokio::test]
async fn test_stream_id_can_be_reused_after_close() {
    init_test_tracing();
    let launcher = Arc::new(ScriptedLauncher::new());
    let controller = configured_controller(
        porch_camera(),
        CamrecConfig::for_testing(),
        launcher.clone(),
        None,
    );

    let first = controller.open_recording_stream(5).await.unwrap();
    let _first_feed = launcher.next_feed().await.unwrap();
    controller
        .close_recording_stream(5, CloseReason::Normal)
        .await;

    let mut again = controller.open_recording_stream(5).await.unwrap();
    let mut feed = launcher.next_feed().await.unwrap();

    // Dropping the stale producer must not tear down the new session.
    drop(first);
    tokio::task::yield_now().await;

    feed.write_boxes(&init_segment()).await.unwrap();
    assert!(next_packet(&mut again).await.unwrap().unwrap().is_init_segment);
    assert_eq!(controller.active_streams(), vec![5]);
    assert!(!feed.is_stopped());
}
