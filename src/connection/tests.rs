use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use super::*;
use crate::broker::PubSubAdapter;
use crate::channel::{Channel, ChannelContext, ChannelDescriptor};
use crate::config::Settings;
use crate::server::Server;
use crate::test_support::{connection_handle, drain_frames, memory_pubsub};
use crate::transport::message::{Broadcast, Frame, ServerMessage};
use crate::utils::error::{ChannelError, ConnectionRejected};
use crate::worker_pool::WorkerPool;

#[derive(Default)]
struct EchoChannel;

impl Channel for EchoChannel {
    fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        if ctx.param("deny") == Some(&json!(true)) {
            ctx.reject();
        }
        Ok(())
    }
}

fn echo_descriptor() -> ChannelDescriptor<EchoChannel> {
    ChannelDescriptor::with_default("EchoChannel")
        .on_subscribe(|_, ctx| {
            let topic = format!("echo:{}", ctx.param_str("id").unwrap_or_default());
            ctx.stream_from(&topic);
            Ok(())
        })
        .action("echo", |_, ctx, data| {
            ctx.transmit(json!({ "echo": data["text"] }));
            Ok(())
        })
}

#[derive(Default)]
struct BrittleChannel;

impl Channel for BrittleChannel {}

/// Streams like any channel but panics while unsubscribing.
fn brittle_descriptor() -> ChannelDescriptor<BrittleChannel> {
    ChannelDescriptor::with_default("BrittleChannel")
        .on_subscribe(|_, ctx| {
            ctx.stream_from("brittle");
            Ok(())
        })
        .on_unsubscribe(|_, _| panic!("unsubscribe hook blew up"))
}

struct UserAuth {
    disconnects: Arc<AtomicUsize>,
}

impl ConnectionHandler for UserAuth {
    fn connect(&self, request: &ConnectRequest) -> Result<IdentifiedBy, ConnectionRejected> {
        match request.query_param("user") {
            Some(user) => Ok(IdentifiedBy::new().with("current_user", user)),
            None => Err(ConnectionRejected::new("missing user")),
        }
    }

    fn disconnect(&self, _identified_by: &IdentifiedBy) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    server: Arc<Server>,
    pubsub: Arc<dyn PubSubAdapter>,
    disconnects: Arc<AtomicUsize>,
}

impl Harness {
    async fn new() -> Self {
        let pubsub = memory_pubsub();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let server = Server::builder(Settings::default())
            .pubsub(pubsub.clone())
            .worker_pool(WorkerPool::inline())
            .channel(echo_descriptor())
            .channel(brittle_descriptor())
            .connection_handler(UserAuth {
                disconnects: disconnects.clone(),
            })
            .build()
            .await
            .expect("server builds");
        Self {
            server,
            pubsub,
            disconnects,
        }
    }

    fn connect(
        &self,
        request: ConnectRequest,
    ) -> (SharedConnection, tokio::sync::mpsc::UnboundedReceiver<tungstenite::Message>) {
        let (handle, rx) = connection_handle();
        (self.server.open_connection(request, handle), rx)
    }
}

fn echo_identifier(id: u32) -> String {
    json!({ "channel": "EchoChannel", "id": id }).to_string()
}

fn subscribe(identifier: &str) -> String {
    json!({ "command": "subscribe", "identifier": identifier }).to_string()
}

fn as_user(user: &str) -> ConnectRequest {
    ConnectRequest::new("/cable").with_query("user", user)
}

#[tokio::test]
async fn accepted_connections_are_welcomed_and_identified() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(as_user("42"));

    assert!(connection.lock().on_open());
    assert_eq!(connection.lock().state(), ConnectionState::Open);
    assert_eq!(drain_frames(&mut rx), vec![Frame::Control(ServerMessage::Welcome)]);

    let guard = connection.lock();
    assert_eq!(guard.handle().identifier(), Some("42"));
    assert_eq!(
        guard.handle().identified_by().and_then(|id| id.get("current_user")),
        Some("42")
    );
    assert_eq!(harness.server.connection_count(), 1);
}

#[tokio::test]
async fn rejected_connections_get_an_unauthorized_disconnect() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(ConnectRequest::new("/cable"));

    assert!(!connection.lock().on_open());
    assert_eq!(
        drain_frames(&mut rx),
        vec![Frame::Control(ServerMessage::Disconnect {
            reason: "unauthorized".to_string(),
            reconnect: false,
        })]
    );
    assert!(connection.lock().handle().is_closed());

    connection.lock().on_message(&subscribe(&echo_identifier(1)));
    connection.lock().on_close();
    assert_eq!(harness.pubsub.subscriber_count(), 0);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(harness.server.connection_count(), 0);
}

#[tokio::test]
async fn commands_drive_the_subscription_lifecycle() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(as_user("7"));
    connection.lock().on_open();
    drain_frames(&mut rx);

    let identifier = echo_identifier(1);
    connection.lock().on_message(&subscribe(&identifier));
    assert_eq!(
        drain_frames(&mut rx),
        vec![Frame::Control(ServerMessage::ConfirmSubscription {
            identifier: identifier.clone()
        })]
    );

    harness
        .server
        .broadcast("echo:1", &json!({ "n": 1 }))
        .unwrap();
    let action = json!({
        "command": "message",
        "identifier": identifier,
        "data": json!({ "action": "echo", "text": "ping" }).to_string(),
    });
    connection.lock().on_message(&action.to_string());
    assert_eq!(
        drain_frames(&mut rx),
        vec![
            Frame::Broadcast(Broadcast {
                identifier: identifier.clone(),
                message: json!({ "n": 1 }),
            }),
            Frame::Broadcast(Broadcast {
                identifier: identifier.clone(),
                message: json!({ "echo": "ping" }),
            }),
        ]
    );

    let unsubscribe = json!({ "command": "unsubscribe", "identifier": identifier });
    connection.lock().on_message(&unsubscribe.to_string());
    assert_eq!(
        drain_frames(&mut rx),
        vec![Frame::Control(ServerMessage::ConfirmUnsubscription {
            identifier: identifier.clone()
        })]
    );
    assert!(connection.lock().subscriptions().is_empty());

    harness.server.broadcast("echo:1", &json!("late")).unwrap();
    assert!(drain_frames(&mut rx).is_empty());
}

#[tokio::test]
async fn bad_input_is_dropped_without_closing() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(as_user("7"));
    connection.lock().on_open();
    drain_frames(&mut rx);

    let identifier = echo_identifier(1);
    let mut guard = connection.lock();
    guard.on_message("{not json");
    guard.on_message(r#"{"command":"teleport","identifier":"x"}"#);
    guard.on_message(&subscribe(r#"{"channel":"NoSuchChannel"}"#));
    guard.on_message(&subscribe("not an identifier"));
    guard.on_message(r#"{"command":"unsubscribe","identifier":"never"}"#);
    guard.on_message(&subscribe(&identifier));
    guard.on_message(&subscribe(&identifier));

    assert_eq!(guard.state(), ConnectionState::Open);
    assert!(!guard.handle().is_closed());
    assert_eq!(guard.subscriptions().identifiers(), vec![identifier.clone()]);
    // a duplicate subscribe does not confirm twice
    assert_eq!(drain_frames(&mut rx).len(), 1);
    assert_eq!(guard.subscriptions().find_all("EchoChannel").len(), 1);
}

#[tokio::test]
async fn refused_subscriptions_are_reported() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(as_user("7"));
    connection.lock().on_open();
    drain_frames(&mut rx);

    let identifier = json!({ "channel": "EchoChannel", "id": 3, "deny": true }).to_string();
    connection.lock().on_message(&subscribe(&identifier));

    assert_eq!(
        drain_frames(&mut rx),
        vec![Frame::Control(ServerMessage::Rejection { identifier })]
    );
    assert!(connection.lock().subscriptions().is_empty());
}

#[tokio::test]
async fn remote_disconnect_closes_matching_connections() {
    let harness = Harness::new().await;
    let (alice, mut alice_rx) = harness.connect(as_user("alice"));
    let (bob, mut bob_rx) = harness.connect(as_user("bob"));
    alice.lock().on_open();
    bob.lock().on_open();
    drain_frames(&mut alice_rx);
    drain_frames(&mut bob_rx);

    harness
        .server
        .remote_connections()
        .where_identified_by(IdentifiedBy::new().with("current_user", "alice"))
        .disconnect(false)
        .unwrap();

    assert_eq!(
        drain_frames(&mut alice_rx),
        vec![Frame::Control(ServerMessage::Disconnect {
            reason: "remote".to_string(),
            reconnect: false,
        })]
    );
    assert!(alice.lock().handle().is_closed());
    assert!(!bob.lock().handle().is_closed());
    assert!(drain_frames(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn closing_releases_everything_once() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(as_user("7"));
    connection.lock().on_open();
    connection.lock().on_message(&subscribe(&echo_identifier(1)));
    connection.lock().on_message(&subscribe(&echo_identifier(2)));
    drain_frames(&mut rx);

    let stats = connection.lock().statistics();
    assert_eq!(stats.identifier.as_deref(), Some("7"));
    assert_eq!(stats.subscriptions.len(), 2);
    assert_eq!(harness.server.connection_stats().len(), 1);
    // two streams plus the control topic
    assert_eq!(harness.pubsub.subscriber_count(), 3);

    connection.lock().on_close();
    connection.lock().on_close();
    assert_eq!(harness.pubsub.subscriber_count(), 0);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(harness.server.connection_count(), 0);
    assert_eq!(connection.lock().state(), ConnectionState::Closed);
}

#[test]
fn identities_join_values_in_key_order() {
    let identity: IdentifiedBy = [("user", "9"), ("account", "acme")].into_iter().collect();
    assert_eq!(identity.connection_identifier().as_deref(), Some("acme:9"));
    assert_eq!(IdentifiedBy::new().connection_identifier(), None);
}

#[test]
fn anonymous_connections_fall_back_to_the_socket_id() {
    let (handle, _rx) = connection_handle();
    let identifier = handle.set_identity(IdentifiedBy::new()).to_string();
    assert_eq!(identifier, handle.id().to_string());
    assert_eq!(
        internal_channel::control_topic(&identifier),
        format!("control/{}", handle.id())
    );
}

#[test]
fn transmitting_after_close_is_refused() {
    let (handle, mut rx) = connection_handle();
    assert!(handle.transmit(ServerMessage::Welcome));
    handle.close();
    assert!(!handle.transmit(ServerMessage::Welcome));
    assert_eq!(drain_frames(&mut rx).len(), 1);
}

#[tokio::test]
async fn a_panicking_channel_does_not_leak_its_siblings_on_close() {
    let harness = Harness::new().await;
    let (connection, mut rx) = harness.connect(as_user("9"));
    connection.lock().on_open();
    connection.lock().on_message(&subscribe(&echo_identifier(1)));
    connection.lock().on_message(&subscribe(&echo_identifier(2)));
    connection
        .lock()
        .on_message(&subscribe(&json!({ "channel": "BrittleChannel" }).to_string()));
    drain_frames(&mut rx);
    // control topic plus three streams
    assert_eq!(harness.pubsub.subscriber_count(), 4);

    let closing = connection.clone();
    let closed = harness
        .server
        .worker_pool()
        .run("test.close", move || closing.lock().on_close())
        .await;

    assert!(closed.is_some());
    assert_eq!(harness.pubsub.subscriber_count(), 0);
    assert_eq!(harness.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(harness.server.connection_count(), 0);
}
