use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::broker::adapter::MessageCallback;
use crate::worker_pool::WorkerPool;

/// `topic -> callbacks` registry shared by every backend.
///
/// All reads and writes go through one mutex. Delivery snapshots the
/// callback list first, so a callback may unsubscribe itself mid-dispatch.
#[derive(Debug, Default)]
pub struct SubscriberMap {
    subscribers: Mutex<HashMap<String, Vec<MessageCallback>>>,
}

impl SubscriberMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `callback` to `topic`. Returns `true` when this is the topic's
    /// first callback, i.e. the backend must start listening.
    pub fn add(&self, topic: &str, callback: MessageCallback) -> bool {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(topic) {
            Some(callbacks) => {
                if !callbacks.contains(&callback) {
                    callbacks.push(callback);
                }
                false
            }
            None => {
                subscribers.insert(topic.to_string(), vec![callback]);
                true
            }
        }
    }

    /// Removes `callback` from `topic`. Returns `true` when the topic has no
    /// callbacks left, i.e. the backend should stop listening.
    pub fn remove(&self, topic: &str, callback: &MessageCallback) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(callbacks) = subscribers.get_mut(topic) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|cb| cb != callback);
        if callbacks.len() == before {
            return false;
        }
        if callbacks.is_empty() {
            subscribers.remove(topic);
            return true;
        }
        false
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.subscribers.lock().contains_key(topic)
    }

    pub fn callbacks(&self, topic: &str) -> Vec<MessageCallback> {
        self.subscribers
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.subscribers.lock().keys().cloned().collect()
    }

    pub fn callback_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }

    /// Hands `payload` to every callback on `topic`, each as its own unit of
    /// work on `pool`. Returns how many callbacks were scheduled.
    pub fn dispatch(&self, topic: &str, payload: &str, pool: &WorkerPool) -> usize {
        let callbacks = self.callbacks(topic);
        trace!(topic, subscribers = callbacks.len(), "dispatching broker message");
        for callback in &callbacks {
            let callback = callback.clone();
            let payload = payload.to_string();
            pool.spawn("pubsub.deliver", move || callback.call(payload));
        }
        callbacks.len()
    }
}
