//! Helpers shared by unit tests across modules.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{MemoryAdapter, MessageCallback, PubSubAdapter, ReadyCallback};
use crate::channel::{Channel, ChannelDescriptor};
use crate::config::Settings;
use crate::connection::{ConnectRequest, ConnectionHandle, ConnectionHandler, IdentifiedBy};
use crate::server::Server;
use crate::transport::message::Frame;
use crate::transport::websocket::serve;
use crate::utils::error::{BrokerError, ConnectionRejected};
use crate::worker_pool::WorkerPool;

pub(crate) fn connection_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectionHandle::new(tx), rx)
}

/// Every frame queued on `rx` so far.
pub(crate) fn drain_frames(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(message) = rx.try_recv() {
        let text = message.to_text().expect("text frame");
        frames.push(serde_json::from_str(text).expect("valid frame"));
    }
    frames
}

pub(crate) fn memory_pubsub() -> Arc<dyn PubSubAdapter> {
    Arc::new(MemoryAdapter::new(WorkerPool::inline()))
}

/// In-memory adapter that holds readiness back until [`release`] is called,
/// like a broker that has not acknowledged a subscription yet.
///
/// [`release`]: DeferredReady::release
pub(crate) struct DeferredReady {
    inner: MemoryAdapter,
    pending: Mutex<Vec<ReadyCallback>>,
}

impl DeferredReady {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryAdapter::new(WorkerPool::inline()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn release(&self) {
        let ready = std::mem::take(&mut *self.pending.lock());
        for callback in ready {
            callback();
        }
    }
}

impl PubSubAdapter for DeferredReady {
    fn name(&self) -> &'static str {
        "deferred"
    }

    fn broadcast(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        self.inner.broadcast(topic, payload)
    }

    fn subscribe(&self, topic: &str, callback: MessageCallback, on_ready: Option<ReadyCallback>) {
        self.inner.subscribe(topic, callback, None);
        if let Some(ready) = on_ready {
            self.pending.lock().push(ready);
        }
    }

    fn unsubscribe(&self, topic: &str, callback: &MessageCallback) {
        self.inner.unsubscribe(topic, callback);
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count()
    }
}

#[derive(Default)]
pub(crate) struct ChatChannel;

impl Channel for ChatChannel {}

fn chat_topic(room: Option<String>) -> String {
    format!("chat:{}", room.unwrap_or_default())
}

/// Streams `chat:<room>`; `speak` broadcasts `{text, from}` to the room.
pub(crate) fn chat() -> ChannelDescriptor<ChatChannel> {
    ChannelDescriptor::with_default("ChatChannel")
        .on_subscribe(|_, ctx| {
            let topic = chat_topic(ctx.param_str("room"));
            ctx.stream_from(&topic);
            Ok(())
        })
        .action("speak", |_, ctx, data| {
            let from = ctx.connection().identifier().unwrap_or_default().to_string();
            let topic = chat_topic(ctx.param_str("room"));
            ctx.broadcast(&topic, &json!({ "text": data["text"], "from": from }))?;
            Ok(())
        })
}

/// Identifies connections by their `user` query parameter.
pub(crate) struct QueryUser;

impl ConnectionHandler for QueryUser {
    fn connect(&self, request: &ConnectRequest) -> Result<IdentifiedBy, ConnectionRejected> {
        request
            .query_param("user")
            .map(|user| IdentifiedBy::new().with("current_user", user))
            .ok_or_else(|| ConnectionRejected::new("no user"))
    }
}

/// A chat server on an ephemeral port; returns it with its `ws://` URL.
pub(crate) async fn start_chat_server(settings: Settings) -> (Arc<Server>, String) {
    let server = Server::builder(settings)
        .worker_pool(WorkerPool::new(4))
        .channel(chat())
        .connection_handler(QueryUser)
        .build()
        .await
        .expect("server builds");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, server.clone()));
    (server, format!("ws://{addr}/cable"))
}
