use tracing::debug;

use crate::broker::adapter::{MessageCallback, PubSubAdapter, ReadyCallback};
use crate::broker::subscriber_map::SubscriberMap;
use crate::utils::error::BrokerError;
use crate::worker_pool::WorkerPool;

/// Single-process backend. Broadcasts never leave the process, which makes
/// it the default for development and the backend of choice in tests.
#[derive(Debug)]
pub struct MemoryAdapter {
    subscribers: SubscriberMap,
    pool: WorkerPool,
}

impl MemoryAdapter {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            subscribers: SubscriberMap::new(),
            pool,
        }
    }
}

impl PubSubAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn broadcast(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let delivered = self.subscribers.dispatch(topic, payload, &self.pool);
        debug!(topic, delivered, "memory broadcast");
        Ok(())
    }

    fn subscribe(&self, topic: &str, callback: MessageCallback, on_ready: Option<ReadyCallback>) {
        self.subscribers.add(topic, callback);
        if let Some(ready) = on_ready {
            self.pool.spawn("pubsub.on_ready", ready);
        }
    }

    fn unsubscribe(&self, topic: &str, callback: &MessageCallback) {
        self.subscribers.remove(topic, callback);
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.callback_count()
    }
}
