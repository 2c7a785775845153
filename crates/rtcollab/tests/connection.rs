mod common;

use common::{eventually, MockServer, ServerEvent};
use rtcollab::{
    transport::ConnectionState, ConnectionManager, EventKind, InboundEvent, OutboundMessage,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_connect_send_and_receive() {
    let server = MockServer::start().await;
    let manager = ConnectionManager::new(server.config(3, 10));

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.router().on(EventKind::ContentSaved, move |event| {
        let _ = tx.send(event.clone());
    });

    manager
        .connect("ws/collab/w1/page/p1/", Some("tok"))
        .await
        .unwrap();
    assert!(manager.is_connected());

    let connected = server.next_event().await;
    assert_eq!(
        connected,
        ServerEvent::Connected {
            path: "/ws/collab/w1/page/p1/".to_string(),
            query: Some("token=tok".to_string()),
        }
    );

    manager.send_message(&OutboundMessage::TypingStart {});
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "typing_start");

    server.push(json!({"type": "content_saved", "version": 4}).to_string());
    let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        InboundEvent::ContentSaved(saved) => assert_eq!(saved.version, Some(4)),
        other => panic!("unexpected event {:?}", other),
    }

    manager.disconnect();
    server
        .wait_for(|event| matches!(event, ServerEvent::Closed { .. }))
        .await;
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_heartbeat_sends_ping() {
    let server = MockServer::start().await;
    server.answer_pings();
    let config = server
        .config(3, 10)
        .with_heartbeat_interval(Duration::from_millis(50));
    let manager = ConnectionManager::new(config);

    let pongs = Arc::new(AtomicUsize::new(0));
    let pongs_clone = pongs.clone();
    manager.router().on(EventKind::Pong, move |_| {
        pongs_clone.fetch_add(1, Ordering::SeqCst);
    });

    manager.connect("ws/notifications/", Some("t")).await.unwrap();

    let ping = server.next_frame_of("ping").await;
    assert!(ping["timestamp"].is_string());
    assert!(eventually(|| pongs.load(Ordering::SeqCst) > 0).await);
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let server = MockServer::start().await;
    let manager = ConnectionManager::new(server.config(3, 10));
    manager.connect("ws/notifications/", Some("t")).await.unwrap();
    server
        .wait_for(|event| matches!(event, ServerEvent::Connected { .. }))
        .await;

    server.close_all();
    server
        .wait_for(|event| matches!(event, ServerEvent::Closed { .. }))
        .await;

    let reconnected = server
        .wait_for(|event| matches!(event, ServerEvent::Connected { .. }))
        .await;
    assert_eq!(
        reconnected,
        ServerEvent::Connected {
            path: "/ws/notifications/".to_string(),
            query: Some("token=t".to_string()),
        }
    );
    assert!(eventually(|| manager.is_connected()).await);

    // The new socket carries traffic
    manager.send_message(&OutboundMessage::MarkRead {
        notification_id: "9".to_string(),
    });
    let frame = server.next_frame_of("mark_read").await;
    assert_eq!(frame["data"]["notification_id"], "9");
}

#[tokio::test]
async fn test_reconnection_is_bounded() {
    let server = MockServer::start().await;
    let manager = ConnectionManager::new(server.config(3, 10));
    manager.connect("ws/notifications/", Some("t")).await.unwrap();
    server
        .wait_for(|event| matches!(event, ServerEvent::Connected { .. }))
        .await;

    server.reject_upgrades(true);
    server.close_all();

    assert!(eventually(|| manager.state() == ConnectionState::Failed).await);
    // Initial handshake plus three retries
    assert_eq!(server.attempts(), 4);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.attempts(), 4);
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnection() {
    let server = MockServer::start().await;
    let manager = ConnectionManager::new(server.config(5, 300));
    manager.connect("ws/notifications/", Some("t")).await.unwrap();
    server
        .wait_for(|event| matches!(event, ServerEvent::Connected { .. }))
        .await;

    server.close_all();
    assert!(
        eventually(|| matches!(manager.state(), ConnectionState::Reconnecting { .. })).await
    );

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Idle);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_reading_error_frames() {
    let server = MockServer::start().await;
    let manager = ConnectionManager::new(server.config(3, 10));

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.router().on(EventKind::Error, move |event| {
        if let InboundEvent::Error(error) = event {
            let _ = tx.send(error.description().to_string());
        }
    });

    manager.connect("ws/notifications/", None).await.unwrap();
    server
        .wait_for(|event| matches!(event, ServerEvent::Connected { .. }))
        .await;

    server.push("not json");
    server.push(json!({"type": "error", "message": "Unknown message type"}).to_string());

    let message = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, "Unknown message type");
    assert!(manager.is_connected());
}
