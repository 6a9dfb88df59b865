use std::time::Duration;

use serde_json::json;

use super::*;
use crate::config::AdapterKind;
use crate::test_support::{connection_handle, drain_frames, memory_pubsub};
use crate::transport::message::Frame;

async fn inline_server(settings: Settings) -> Arc<Server> {
    Server::builder(settings)
        .pubsub(memory_pubsub())
        .worker_pool(WorkerPool::inline())
        .build()
        .await
        .expect("server builds")
}

#[tokio::test]
async fn builds_its_adapter_from_settings() {
    let settings = Settings::default();
    assert_eq!(settings.pubsub.adapter, AdapterKind::Memory);
    let server = Server::builder(settings).build().await.unwrap();
    assert_eq!(server.pubsub().name(), "memory");
    assert_eq!(server.worker_pool().size(), 4);
    assert!(server.channels().is_empty());
}

#[tokio::test]
async fn anonymous_connections_cannot_be_targeted_remotely() {
    let server = inline_server(Settings::default()).await;
    let result = server
        .remote_connections()
        .where_identified_by(IdentifiedBy::new())
        .disconnect(true);
    assert!(matches!(result, Err(CableError::InvalidIdentifier(_))));
}

#[tokio::test]
async fn broadcast_reaches_broker_subscribers() {
    let server = inline_server(Settings::default()).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.pubsub().subscribe(
        "news",
        crate::broker::MessageCallback::new(move |payload| {
            let _ = tx.send(payload);
        }),
        None,
    );

    server.broadcast("news", &json!({ "headline": "hi" })).unwrap();
    assert_eq!(rx.try_recv().unwrap(), r#"{"headline":"hi"}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_pings_open_connections_only() {
    let mut settings = Settings::default();
    settings.heartbeat.interval_secs = 1;
    let server = inline_server(settings).await;

    let (open, mut open_rx) = connection_handle();
    let (pending, mut pending_rx) = connection_handle();
    let connection = server.open_connection(ConnectRequest::new("/"), open);
    let _pending = server.open_connection(ConnectRequest::new("/"), pending);
    assert!(connection.lock().on_open());
    drain_frames(&mut open_rx);

    server.start_heartbeat();
    server.start_heartbeat();
    tokio::time::sleep(Duration::from_millis(1_300)).await;

    let frames = drain_frames(&mut open_rx);
    assert!(!frames.is_empty());
    assert!(
        frames
            .iter()
            .all(|frame| matches!(frame, Frame::Control(ServerMessage::Ping { .. })))
    );
    assert!(drain_frames(&mut pending_rx).is_empty());
}

#[tokio::test]
async fn shutdown_tells_clients_the_server_is_restarting() {
    let server = inline_server(Settings::default()).await;
    let (handle, mut rx) = connection_handle();
    let connection = server.open_connection(ConnectRequest::new("/"), handle.clone());
    connection.lock().on_open();
    drain_frames(&mut rx);

    server.shutdown().await;

    assert_eq!(
        drain_frames(&mut rx),
        vec![Frame::Control(ServerMessage::Disconnect {
            reason: "server_restart".to_string(),
            reconnect: true,
        })]
    );
    assert!(handle.is_closed());
}
