use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::Settings;
use crate::connection::IdentifiedBy;
use crate::test_support::start_chat_server as start;
use crate::transport::message::{Broadcast, Frame, ServerMessage};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &str, user: &str) -> Client {
    let (ws, _) = connect_async(format!("{url}?user={user}"))
        .await
        .expect("handshake");
    ws
}

async fn send(ws: &mut Client, command: Value) {
    ws.send(WsMessage::text(command.to_string()))
        .await
        .expect("send");
}

/// Next frame from the server, skipping heartbeats.
async fn next_frame(ws: &mut Client) -> Frame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("read ok");
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: Frame = serde_json::from_str(&text).expect("valid frame");
        if !matches!(frame, Frame::Control(ServerMessage::Ping { .. })) {
            return frame;
        }
    }
}

async fn expect_closed(ws: &mut Client) {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("close in time");
        match next {
            Some(Ok(WsMessage::Text(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    }
}

async fn subscribe(ws: &mut Client, identifier: &str) {
    send(ws, json!({ "command": "subscribe", "identifier": identifier })).await;
    assert_eq!(
        next_frame(ws).await,
        Frame::Control(ServerMessage::ConfirmSubscription {
            identifier: identifier.to_string()
        })
    );
}

fn room(id: &str) -> String {
    json!({ "channel": "ChatChannel", "room": id }).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chat_messages_reach_every_subscriber_in_the_room() {
    let (_server, url) = start(Settings::default()).await;
    let mut alice = connect(&url, "alice").await;
    let mut bob = connect(&url, "bob").await;
    assert_eq!(next_frame(&mut alice).await, Frame::Control(ServerMessage::Welcome));
    assert_eq!(next_frame(&mut bob).await, Frame::Control(ServerMessage::Welcome));

    let identifier = room("1");
    subscribe(&mut alice, &identifier).await;
    subscribe(&mut bob, &identifier).await;

    let data = json!({ "action": "speak", "text": "hello" }).to_string();
    send(
        &mut alice,
        json!({ "command": "message", "identifier": identifier, "data": data }),
    )
    .await;

    let expected = Frame::Broadcast(Broadcast {
        identifier: identifier.clone(),
        message: json!({ "text": "hello", "from": "alice" }),
    });
    assert_eq!(next_frame(&mut alice).await, expected);
    assert_eq!(next_frame(&mut bob).await, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unidentified_clients_are_turned_away() {
    let (server, url) = start(Settings::default()).await;
    let (mut ws, _) = connect_async(url.as_str()).await.expect("handshake");

    assert_eq!(
        next_frame(&mut ws).await,
        Frame::Control(ServerMessage::Disconnect {
            reason: "unauthorized".to_string(),
            reconnect: false,
        })
    );
    expect_closed(&mut ws).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_disconnect_closes_the_socket() {
    let (server, url) = start(Settings::default()).await;
    let mut ws = connect(&url, "carol").await;
    assert_eq!(next_frame(&mut ws).await, Frame::Control(ServerMessage::Welcome));

    server
        .remote_connections()
        .where_identified_by(IdentifiedBy::new().with("current_user", "carol"))
        .disconnect(true)
        .expect("published");

    assert_eq!(
        next_frame(&mut ws).await,
        Frame::Control(ServerMessage::Disconnect {
            reason: "remote".to_string(),
            reconnect: true,
        })
    );
    expect_closed(&mut ws).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_commands_do_not_break_the_connection() {
    let (server, url) = start(Settings::default()).await;
    let mut ws = connect(&url, "dave").await;
    assert_eq!(next_frame(&mut ws).await, Frame::Control(ServerMessage::Welcome));

    ws.send(WsMessage::text("{definitely not json"))
        .await
        .expect("send");
    let identifier = room("2");
    subscribe(&mut ws, &identifier).await;

    server
        .broadcast("chat:2", &json!({ "text": "from the server" }))
        .unwrap();
    assert_eq!(
        next_frame(&mut ws).await,
        Frame::Broadcast(Broadcast {
            identifier,
            message: json!({ "text": "from the server" }),
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disallowed_origins_fail_the_handshake() {
    let mut settings = Settings::default();
    settings.server.allowed_origins = vec!["https://app.example".to_string()];
    let (_server, url) = start(settings).await;

    let mut request = format!("{url}?user=erin").into_client_request().expect("request");
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example"));
    assert!(connect_async(request).await.is_err());

    let mut request = format!("{url}?user=erin").into_client_request().expect("request");
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://app.example"));
    let (mut ws, _) = connect_async(request).await.expect("handshake");
    assert_eq!(next_frame(&mut ws).await, Frame::Control(ServerMessage::Welcome));
}
