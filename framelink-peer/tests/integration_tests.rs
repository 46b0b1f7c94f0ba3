//! Integration tests for the analysis peer
//!
//! These tests run the peer on an ephemeral loopback port and talk to it with
//! the same WebSocket connector a capture session uses.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_test::assert_ok;

use framelink_core::{
    CloseCode, Connection, Connector, FrameEnvelope, InboundMessage, OutboundMessage, TransportEvent,
    WebSocketConnector,
};
use framelink_media::{
    CaptureConstraints, DeviceFactory, FrameEncoder, SyntheticDeviceFactory, VideoResolution,
};
use framelink_peer::{AnalysisPeer, PeerConfig, PeerHandle};

async fn start_test_peer(config: PeerConfig) -> PeerHandle {
    AnalysisPeer::bind(config).await.unwrap().spawn()
}

async fn next_message(events: &mut UnboundedReceiver<TransportEvent>) -> InboundMessage {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(TransportEvent::Text(text))) => return InboundMessage::parse(&text).unwrap(),
            Ok(Some(TransportEvent::Binary(_))) => continue,
            Ok(Some(TransportEvent::Closed { code, .. })) => panic!("Connection closed: {}", code),
            Ok(None) => panic!("Event channel closed"),
            Err(_) => panic!("Timed out waiting for a message"),
        }
    }
}

async fn next_close(events: &mut UnboundedReceiver<TransportEvent>) -> CloseCode {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(TransportEvent::Closed { code, .. })) => return code,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("Event channel closed without a close event"),
            Err(_) => panic!("Timed out waiting for close"),
        }
    }
}

async fn frame_data_url() -> String {
    let device = SyntheticDeviceFactory::new()
        .open(&CaptureConstraints::default().with_resolution(VideoResolution::new(64, 48)))
        .await
        .unwrap();
    let frame = device.grab_frame().await.unwrap();
    FrameEncoder::default().encode(&frame).unwrap().to_data_url()
}

#[tokio::test]
async fn test_status_on_connect() {
    let peer = start_test_peer(PeerConfig::loopback()).await;
    let mut established = assert_ok!(WebSocketConnector::new().connect(&peer.endpoint()).await);

    match next_message(&mut established.events).await {
        InboundMessage::Status { message } => assert!(!message.is_empty()),
        other => panic!("Expected status, got {:?}", other),
    }
    assert_eq!(peer.stats().connections_accepted, 1);
}

#[tokio::test]
async fn test_frame_is_analysed() {
    let peer = start_test_peer(PeerConfig::loopback()).await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;

    let frame = OutboundMessage::Frame {
        data_url: frame_data_url().await,
    };
    for envelope in [FrameEnvelope::DataUrl, FrameEnvelope::Json] {
        established
            .connection
            .send_text(frame.to_text(envelope))
            .await
            .unwrap();
    }

    for expected in 1..=2 {
        match next_message(&mut established.events).await {
            InboundMessage::Analysis(payload) => {
                assert_eq!(payload.frame_number, expected);
                assert!(payload.message.unwrap().contains("64x48"));
                assert!(payload.fps_average.is_some());
                assert!(payload.session_duration.is_some());
            }
            other => panic!("Expected analysis, got {:?}", other),
        }
    }
    assert_eq!(peer.stats().frames_analysed, 2);
}

#[tokio::test]
async fn test_ping_pong() {
    let peer = start_test_peer(PeerConfig::loopback()).await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;

    established
        .connection
        .send_text(OutboundMessage::Ping.to_text(FrameEnvelope::DataUrl))
        .await
        .unwrap();

    assert_eq!(next_message(&mut established.events).await, InboundMessage::Pong);
    assert_eq!(peer.stats().pings_answered, 1);
}

#[tokio::test]
async fn test_bad_frame_gets_error_reply() {
    let peer = start_test_peer(PeerConfig::loopback()).await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;

    established
        .connection
        .send_text("data:image/jpeg;base64,aGVsbG8=".to_string())
        .await
        .unwrap();
    established
        .connection
        .send_text("hello there".to_string())
        .await
        .unwrap();

    for _ in 0..2 {
        assert!(matches!(
            next_message(&mut established.events).await,
            InboundMessage::Error { .. }
        ));
    }
    assert_eq!(peer.stats().frames_rejected, 1);
}

#[tokio::test]
async fn test_close_request_closes_normally() {
    let peer = start_test_peer(PeerConfig::loopback()).await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;

    established
        .connection
        .send_text(OutboundMessage::Close.to_text(FrameEnvelope::DataUrl))
        .await
        .unwrap();

    assert_eq!(next_close(&mut established.events).await, CloseCode::NORMAL);
    assert!(!established.connection.is_open());
}

#[tokio::test]
async fn test_drop_after_frames_is_abnormal() {
    let peer = start_test_peer(PeerConfig::loopback().with_drop_after_frames(1)).await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;

    established
        .connection
        .send_text(frame_data_url().await)
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut established.events).await,
        InboundMessage::Analysis(_)
    ));

    let code = next_close(&mut established.events).await;
    assert!(!code.is_normal());
    assert_eq!(peer.stats().connections_dropped, 1);
}

#[tokio::test]
async fn test_idle_client_is_pinged() {
    let peer = start_test_peer(
        PeerConfig::loopback().with_idle_ping(Some(Duration::from_millis(100))),
    )
    .await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;

    assert_eq!(next_message(&mut established.events).await, InboundMessage::Ping);
}

#[tokio::test]
async fn test_shutdown_drops_clients() {
    let peer = start_test_peer(PeerConfig::loopback()).await;
    let mut established = WebSocketConnector::new().connect(&peer.endpoint()).await.unwrap();
    next_message(&mut established.events).await;
    assert_eq!(peer.clients().len(), 1);

    peer.shutdown();
    let code = next_close(&mut established.events).await;
    assert!(!code.is_normal());
}
