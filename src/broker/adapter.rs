use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::error::BrokerError;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// A message handler registered on a broker topic.
///
/// Closures have no identity of their own, so each callback carries an id
/// assigned at construction. Clones share the id; `unsubscribe` removes the
/// registration with the matching id and nothing else.
#[derive(Clone)]
pub struct MessageCallback {
    id: u64,
    func: Arc<dyn Fn(String) + Send + Sync>,
}

impl MessageCallback {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            id: NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed),
            func: Arc::new(func),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call(&self, payload: String) {
        (self.func)(payload)
    }
}

impl PartialEq for MessageCallback {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageCallback {}

impl fmt::Debug for MessageCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageCallback").field(&self.id).finish()
    }
}

/// Invoked once the backend has acknowledged a subscription.
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Cross-process broadcast bus used by channels and connections.
///
/// Any number of callbacks may share a topic. Implementations own the
/// fan-out and never run callbacks on the caller's I/O path.
pub trait PubSubAdapter: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Publishes `payload` to every subscriber of `topic`, in any process.
    fn broadcast(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;

    /// Registers `callback` on `topic`. `on_ready` runs once the backend
    /// confirms the subscription is live.
    fn subscribe(&self, topic: &str, callback: MessageCallback, on_ready: Option<ReadyCallback>);

    /// Removes exactly `callback` from `topic`.
    fn unsubscribe(&self, topic: &str, callback: &MessageCallback);

    /// Number of callbacks currently registered, across all topics.
    fn subscriber_count(&self) -> usize;

    /// Stops background listeners. Further subscriptions are not served.
    fn shutdown(&self) {}
}
