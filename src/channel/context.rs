use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::broker::{MessageCallback, PubSubAdapter};
use crate::connection::ConnectionHandle;
use crate::transport::message::{Broadcast, ServerMessage};
use crate::utils::error::BrokerError;
use crate::worker_pool::WorkerPool;

/// One subscription on one connection: where channel output is delivered.
///
/// Stream callbacks keep a clone of this after the channel returns; once the
/// channel is torn down the target goes inactive and drops everything.
#[derive(Clone)]
pub struct ClientTarget {
    identifier: Arc<str>,
    connection: ConnectionHandle,
    active: Arc<AtomicBool>,
}

impl ClientTarget {
    pub(crate) fn new(identifier: &str, connection: ConnectionHandle) -> Self {
        Self {
            identifier: Arc::from(identifier),
            connection,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Sends `{identifier, message}` to the client.
    pub fn transmit(&self, message: Value) -> bool {
        if !self.is_active() {
            trace!(identifier = %self.identifier, "dropping message for inactive subscription");
            return false;
        }
        self.connection.transmit(Broadcast {
            identifier: self.identifier.to_string(),
            message,
        })
    }

    pub(crate) fn transmit_control(&self, message: ServerMessage) -> bool {
        self.is_active() && self.connection.transmit(message)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Holds `confirm_subscription` back until every stream opened while
/// subscribing is live on the broker, then sends it exactly once.
pub(crate) struct Confirmation {
    pending: AtomicUsize,
    armed: AtomicBool,
    sent: AtomicBool,
    target: ClientTarget,
}

impl Confirmation {
    fn new(target: ClientTarget) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
            sent: AtomicBool::new(false),
            target,
        }
    }

    fn expect_stream(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_ready(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.try_send();
    }

    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
        self.try_send();
    }

    fn try_send(&self) {
        if self.armed.load(Ordering::SeqCst)
            && self.pending.load(Ordering::SeqCst) == 0
            && !self.sent.swap(true, Ordering::SeqCst)
        {
            self.target.transmit_control(ServerMessage::ConfirmSubscription {
                identifier: self.target.identifier().to_string(),
            });
        }
    }
}

/// Everything a channel can reach while one of its hooks, actions or timers
/// runs. Passed explicitly; there is no ambient "current connection".
pub struct ChannelContext {
    target: ClientTarget,
    params: Map<String, Value>,
    pubsub: Arc<dyn PubSubAdapter>,
    pool: WorkerPool,
    streams: Vec<(String, MessageCallback)>,
    confirmation: Arc<Confirmation>,
    authorized: bool,
    rejected: bool,
}

impl ChannelContext {
    pub(crate) fn new(
        identifier: &str,
        params: Map<String, Value>,
        connection: ConnectionHandle,
        pubsub: Arc<dyn PubSubAdapter>,
        pool: WorkerPool,
    ) -> Self {
        let target = ClientTarget::new(identifier, connection);
        Self {
            confirmation: Arc::new(Confirmation::new(target.clone())),
            target,
            params,
            pubsub,
            pool,
            streams: Vec::new(),
            authorized: false,
            rejected: false,
        }
    }

    pub fn identifier(&self) -> &str {
        self.target.identifier()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// String form of a parameter; numbers and booleans are stringified.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        self.target.connection()
    }

    pub fn target(&self) -> &ClientTarget {
        &self.target
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Sends `message` to this subscription's client. Refused while the
    /// channel is not authorized.
    pub fn transmit(&self, message: Value) -> bool {
        if !self.authorized {
            warn!(identifier = %self.identifier(), "refusing to transmit from an unauthorized channel");
            return false;
        }
        self.target.transmit(message)
    }

    /// Publishes `message` on a broker topic, reaching every stream on it.
    pub fn broadcast(&self, topic: &str, message: &Value) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(message)?;
        self.pubsub.broadcast(topic, &payload)
    }

    /// Forwards everything published on `topic` to this subscription.
    pub fn stream_from(&mut self, topic: &str) {
        let via = topic.to_string();
        self.stream_from_with(topic, move |target, payload| {
            let message = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
            trace!(identifier = %target.identifier(), via = %via, "streaming broadcast");
            target.transmit(message);
        });
    }

    /// Like [`stream_from`](Self::stream_from) with a custom handler for
    /// each raw broker payload.
    pub fn stream_from_with<F>(&mut self, topic: &str, handler: F)
    where
        F: Fn(&ClientTarget, String) + Send + Sync + 'static,
    {
        let target = self.target.clone();
        let callback = MessageCallback::new(move |payload| {
            if target.is_active() {
                handler(&target, payload);
            }
        });

        self.confirmation.expect_stream();
        let confirmation = self.confirmation.clone();
        self.pubsub.subscribe(
            topic,
            callback.clone(),
            Some(Box::new(move || confirmation.stream_ready())),
        );
        debug!(identifier = %self.identifier(), topic, "streaming");
        self.streams.push((topic.to_string(), callback));
    }

    pub fn stop_stream_from(&mut self, topic: &str) {
        let pubsub = &self.pubsub;
        self.streams.retain(|(streamed, callback)| {
            if streamed == topic {
                pubsub.unsubscribe(streamed, callback);
                false
            } else {
                true
            }
        });
    }

    /// Releases every broker subscription this channel opened.
    pub fn stop_all_streams(&mut self) {
        for (topic, callback) in self.streams.drain(..) {
            self.pubsub.unsubscribe(&topic, &callback);
            debug!(identifier = %self.target.identifier(), topic = %topic, "stopped streaming");
        }
    }

    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|(topic, _)| topic.as_str())
    }

    /// Refuses the subscription from within a subscribe hook.
    pub fn reject(&mut self) {
        self.rejected = true;
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub(crate) fn set_authorized(&mut self, authorized: bool) {
        self.authorized = authorized;
    }

    pub(crate) fn confirmation(&self) -> &Confirmation {
        &self.confirmation
    }
}
