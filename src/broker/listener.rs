//! Dedicated listener thread for backends without native multi-callback
//! fan-out.
//!
//! One OS thread owns one long-lived store connection. Callers on other
//! threads only touch the shared [`SubscriberMap`] and push commands onto a
//! mutex-guarded queue; the thread drains that queue between short
//! notify-waits, so it is the only place LISTEN/UNLISTEN statements are
//! issued. The store-level subscription follows the map: it is opened when a
//! topic gains its first callback and closed when it loses the last one.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::adapter::{MessageCallback, ReadyCallback};
use crate::broker::subscriber_map::SubscriberMap;
use crate::utils::error::BrokerError;
use crate::worker_pool::WorkerPool;

/// A message delivered by the store on `channel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// One live store connection, used only from the listener thread.
pub trait NotifySession {
    fn listen(&mut self, channel: &str) -> Result<(), BrokerError>;

    fn unlisten(&mut self, channel: &str) -> Result<(), BrokerError>;

    /// Blocks for at most `timeout`. `Ok(None)` means nothing arrived; an
    /// error means the connection is gone.
    fn wait_for_notify(&mut self, timeout: Duration) -> Result<Option<Notification>, BrokerError>;
}

/// Opens store connections for the listener thread, again after every drop.
pub trait NotifyConnector: Send + 'static {
    fn connect(&mut self) -> Result<Box<dyn NotifySession>, BrokerError>;
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub thread_name: String,
    pub poll_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            thread_name: "popcable-listener".to_string(),
            poll_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

enum Command {
    Listen {
        channel: String,
        on_ready: Option<ReadyCallback>,
    },
    Unlisten {
        channel: String,
    },
}

/// The listener object owned by a backend instance.
///
/// The thread starts lazily with the first subscription and is stopped and
/// joined by [`NotifyListener::shutdown`] or on drop.
pub struct NotifyListener {
    subscribers: Arc<SubscriberMap>,
    queue: Arc<Mutex<VecDeque<Command>>>,
    stopping: Arc<AtomicBool>,
    connector: Mutex<Option<Box<dyn NotifyConnector>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pool: WorkerPool,
    config: ListenerConfig,
}

impl NotifyListener {
    pub fn new<C>(connector: C, pool: WorkerPool, config: ListenerConfig) -> Self
    where
        C: NotifyConnector,
    {
        Self {
            subscribers: Arc::new(SubscriberMap::new()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            connector: Mutex::new(Some(Box::new(connector))),
            thread: Mutex::new(None),
            pool,
            config,
        }
    }

    pub fn subscribers(&self) -> &SubscriberMap {
        &self.subscribers
    }

    pub fn add_subscriber(
        &self,
        channel: &str,
        callback: MessageCallback,
        on_ready: Option<ReadyCallback>,
    ) {
        if self.subscribers.add(channel, callback) {
            self.queue.lock().push_back(Command::Listen {
                channel: channel.to_string(),
                on_ready,
            });
            self.ensure_running();
        } else if let Some(ready) = on_ready {
            self.pool.spawn("pubsub.on_ready", ready);
        }
    }

    pub fn remove_subscriber(&self, channel: &str, callback: &MessageCallback) {
        if self.subscribers.remove(channel, callback) {
            self.queue.lock().push_back(Command::Unlisten {
                channel: channel.to_string(),
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("pubsub listener thread panicked");
            }
        }
    }

    fn ensure_running(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let Some(connector) = self.connector.lock().take() else {
            return;
        };

        let worker = ListenerThread {
            subscribers: self.subscribers.clone(),
            queue: self.queue.clone(),
            stopping: self.stopping.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
            connector,
        };
        match thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || worker.run())
        {
            Ok(handle) => *thread = Some(handle),
            Err(e) => error!(error = %e, "failed to spawn pubsub listener thread"),
        }
    }
}

impl Drop for NotifyListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ListenerThread {
    subscribers: Arc<SubscriberMap>,
    queue: Arc<Mutex<VecDeque<Command>>>,
    stopping: Arc<AtomicBool>,
    pool: WorkerPool,
    config: ListenerConfig,
    connector: Box<dyn NotifyConnector>,
}

impl ListenerThread {
    fn run(mut self) {
        info!(thread = %self.config.thread_name, "pubsub listener started");
        while !self.stopping() {
            let mut session = match self.connector.connect() {
                Ok(session) => session,
                Err(e) => {
                    error!(error = %e, "pubsub listener could not connect; retrying");
                    self.pause();
                    continue;
                }
            };

            let mut listening = HashSet::new();
            match self.serve(session.as_mut(), &mut listening) {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, topics = listening.len(), "pubsub listener connection lost; reconnecting");
                    self.pause();
                }
            }
        }
        info!(thread = %self.config.thread_name, "pubsub listener stopped");
    }

    /// Runs one connection until shutdown (`Ok`) or failure (`Err`).
    fn serve(
        &mut self,
        session: &mut dyn NotifySession,
        listening: &mut HashSet<String>,
    ) -> Result<(), BrokerError> {
        // After a reconnect the map is the source of truth: everything still
        // registered gets its LISTEN back before we wait again.
        for channel in self.subscribers.topics() {
            session.listen(&channel)?;
            listening.insert(channel);
        }

        while !self.stopping() {
            self.drain(session, listening)?;
            if let Some(notification) = session.wait_for_notify(self.config.poll_timeout)? {
                self.subscribers
                    .dispatch(&notification.channel, &notification.payload, &self.pool);
            }
        }
        Ok(())
    }

    fn drain(
        &mut self,
        session: &mut dyn NotifySession,
        listening: &mut HashSet<String>,
    ) -> Result<(), BrokerError> {
        loop {
            let Some(command) = self.queue.lock().pop_front() else {
                return Ok(());
            };

            match command {
                Command::Listen { channel, on_ready } => {
                    if !listening.contains(&channel) && self.subscribers.contains(&channel) {
                        if let Err(e) = session.listen(&channel) {
                            // keep the ready callback for the next connection
                            self.queue
                                .lock()
                                .push_front(Command::Listen { channel, on_ready });
                            return Err(e);
                        }
                        debug!(channel = %channel, "listening");
                        listening.insert(channel);
                    }
                    if let Some(ready) = on_ready {
                        self.pool.spawn("pubsub.on_ready", ready);
                    }
                }
                Command::Unlisten { channel } => {
                    if listening.contains(&channel) && !self.subscribers.contains(&channel) {
                        session.unlisten(&channel)?;
                        debug!(channel = %channel, "stopped listening");
                        listening.remove(&channel);
                    }
                }
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        // sleep in small slices so shutdown is not held up by the delay
        let slice = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while waited < self.config.reconnect_delay && !self.stopping() {
            thread::sleep(slice);
            waited += slice;
        }
    }
}
