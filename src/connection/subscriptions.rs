use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::broker::PubSubAdapter;
use crate::channel::identifier;
use crate::channel::instance::SubscribeOutcome;
use crate::channel::{ChannelCatalog, ChannelContext, ChannelInstance, SharedChannel};
use crate::connection::ConnectionHandle;
use crate::transport::message::{ClientCommand, ServerMessage};
use crate::worker_pool::WorkerPool;

/// The channel instances of one connection, keyed by the exact identifier
/// string the client subscribed with.
pub struct Subscriptions {
    handle: ConnectionHandle,
    channels: Arc<ChannelCatalog>,
    pubsub: Arc<dyn PubSubAdapter>,
    pool: WorkerPool,
    subscriptions: HashMap<String, SharedChannel>,
}

impl Subscriptions {
    pub fn new(
        handle: ConnectionHandle,
        channels: Arc<ChannelCatalog>,
        pubsub: Arc<dyn PubSubAdapter>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            handle,
            channels,
            pubsub,
            pool,
            subscriptions: HashMap::new(),
        }
    }

    pub fn execute_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Subscribe { identifier } => {
                self.add(&identifier);
            }
            ClientCommand::Unsubscribe { identifier } => {
                self.remove(&identifier);
            }
            ClientCommand::Message { identifier, data } => self.perform_action(&identifier, &data),
        }
    }

    /// Subscribes to the channel named in `identifier`.
    ///
    /// A repeated identifier keeps the existing instance. Returns `None` when
    /// the identifier is unusable or the channel refused the subscription;
    /// refusals are reported to the client with `rejection`.
    pub fn add(&mut self, identifier: &str) -> Option<SharedChannel> {
        if let Some(existing) = self.subscriptions.get(identifier) {
            warn!(connection = %self.handle.id(), identifier, "already subscribed");
            return Some(existing.clone());
        }

        let parsed = match identifier::parse(identifier) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(connection = %self.handle.id(), error = %e, "ignoring subscribe");
                return None;
            }
        };
        let Some(kind) = self.channels.get(&parsed.channel) else {
            error!(connection = %self.handle.id(), channel = %parsed.channel, "subscription class not found");
            return None;
        };

        let ctx = ChannelContext::new(
            identifier,
            parsed.params,
            self.handle.clone(),
            self.pubsub.clone(),
            self.pool.clone(),
        );
        let instance = Arc::new(Mutex::new(ChannelInstance::new(kind, ctx)));
        match ChannelInstance::subscribe(&instance) {
            SubscribeOutcome::Subscribed => {
                self.subscriptions
                    .insert(identifier.to_string(), instance.clone());
                Some(instance)
            }
            SubscribeOutcome::Rejected => {
                self.handle.transmit(ServerMessage::Rejection {
                    identifier: identifier.to_string(),
                });
                None
            }
        }
    }

    /// Unsubscribes and confirms with `confirm_unsubscription`.
    pub fn remove(&mut self, identifier: &str) -> bool {
        let Some(instance) = self.subscriptions.remove(identifier) else {
            error!(connection = %self.handle.id(), identifier, "unable to find subscription to remove");
            return false;
        };
        instance.lock().unsubscribe();
        self.handle.transmit(ServerMessage::ConfirmUnsubscription {
            identifier: identifier.to_string(),
        });
        true
    }

    pub fn perform_action(&mut self, identifier: &str, data: &Value) {
        match self.find(identifier) {
            Some(instance) => instance.lock().perform_action(data),
            None => error!(connection = %self.handle.id(), identifier, "unable to find subscription for message"),
        }
    }

    pub fn find(&self, identifier: &str) -> Option<SharedChannel> {
        self.subscriptions.get(identifier).cloned()
    }

    /// Every instance of the channel registered as `kind`.
    pub fn find_all(&self, kind: &str) -> Vec<SharedChannel> {
        self.subscriptions
            .values()
            .filter(|instance| instance.lock().kind() == kind)
            .cloned()
            .collect()
    }

    /// Tears down every subscription without confirming; used on close.
    pub fn unsubscribe_from_all(&mut self) {
        for (identifier, instance) in self.subscriptions.drain() {
            instance.lock().unsubscribe();
            debug!(connection = %self.handle.id(), identifier = %identifier, "unsubscribed on close");
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.subscriptions.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
