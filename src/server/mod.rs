//! The server object shared by every connection.
//!
//! It owns the broker adapter, the channel catalog, the connection handler
//! and the worker pool, and keeps track of open connections for heartbeats,
//! statistics and shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{self, PubSubAdapter};
use crate::channel::{Channel, ChannelCatalog, ChannelDescriptor};
use crate::config::Settings;
use crate::connection::internal_channel;
use crate::connection::{
    AllowAll, ConnectRequest, Connection, ConnectionHandle, ConnectionHandler, ConnectionStats,
    IdentifiedBy, SharedConnection,
};
use crate::transport::message::{DisconnectReason, ServerMessage};
use crate::utils::error::CableError;
use crate::worker_pool::WorkerPool;

struct Tracked {
    handle: ConnectionHandle,
    connection: Weak<Mutex<Connection>>,
}

pub struct Server {
    settings: Settings,
    pubsub: Arc<dyn PubSubAdapter>,
    channels: Arc<ChannelCatalog>,
    handler: Arc<dyn ConnectionHandler>,
    pool: WorkerPool,
    connections: Mutex<HashMap<Uuid, Tracked>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(settings: Settings) -> ServerBuilder {
        ServerBuilder {
            settings,
            pubsub: None,
            channels: ChannelCatalog::new(),
            handler: Arc::new(AllowAll),
            pool: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSubAdapter> {
        &self.pubsub
    }

    pub fn channels(&self) -> &Arc<ChannelCatalog> {
        &self.channels
    }

    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Publishes `message` to every stream on `topic`, in every process
    /// sharing the broker.
    pub fn broadcast(&self, topic: &str, message: &Value) -> Result<(), CableError> {
        let payload = serde_json::to_string(message)?;
        debug!(topic, "broadcasting");
        self.pubsub.broadcast(topic, &payload)?;
        Ok(())
    }

    pub fn remote_connections(&self) -> RemoteConnections<'_> {
        RemoteConnections { server: self }
    }

    /// Creates and tracks the connection for a freshly upgraded socket.
    pub fn open_connection(
        self: &Arc<Self>,
        request: ConnectRequest,
        handle: ConnectionHandle,
    ) -> SharedConnection {
        let connection = Arc::new(Mutex::new(Connection::new(
            self.clone(),
            request,
            handle.clone(),
        )));
        self.connections.lock().insert(
            handle.id(),
            Tracked {
                handle,
                connection: Arc::downgrade(&connection),
            },
        );
        connection
    }

    pub(crate) fn untrack(&self, id: Uuid) {
        self.connections.lock().remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Statistics for every tracked connection.
    ///
    /// Locks each connection in turn, so avoid calling it from channel code.
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        let connections: Vec<_> = self
            .connections
            .lock()
            .values()
            .filter_map(|tracked| tracked.connection.upgrade())
            .collect();
        connections
            .iter()
            .map(|connection| connection.lock().statistics())
            .collect()
    }

    /// Pings every accepted connection each `heartbeat.interval_secs`.
    /// A second call is a no-op.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            return;
        }
        let interval = Duration::from_secs(self.settings.heartbeat.interval_secs.max(1));
        let server = Arc::downgrade(self);
        *heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.beat();
            }
        }));
    }

    fn beat(&self) {
        let ping = ServerMessage::Ping {
            message: Utc::now().timestamp(),
        };
        for handle in self.open_handles() {
            handle.transmit(ping.clone());
        }
    }

    fn open_handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .lock()
            .values()
            .filter(|tracked| tracked.handle.identifier().is_some())
            .map(|tracked| tracked.handle.clone())
            .collect()
    }

    /// Tells every client the server is restarting, closes their sockets and
    /// shuts the broker adapter down.
    pub async fn shutdown(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
        let handles = self.open_handles();
        info!(connections = handles.len(), "shutting down");
        for handle in handles {
            handle.transmit(ServerMessage::disconnect(DisconnectReason::ServerRestart, true));
            handle.close();
        }

        let pubsub = self.pubsub.clone();
        if self
            .pool
            .run("pubsub.shutdown", move || pubsub.shutdown())
            .await
            .is_none()
        {
            warn!("pubsub adapter shutdown panicked");
        }
    }
}

/// Entry point for acting on connections by identity, wherever they live.
pub struct RemoteConnections<'a> {
    server: &'a Server,
}

impl<'a> RemoteConnections<'a> {
    pub fn where_identified_by(&self, identified_by: IdentifiedBy) -> RemoteConnection<'a> {
        RemoteConnection {
            server: self.server,
            identified_by,
        }
    }
}

pub struct RemoteConnection<'a> {
    server: &'a Server,
    identified_by: IdentifiedBy,
}

impl RemoteConnection<'_> {
    /// Publishes a disconnect on the connection's control topic.
    pub fn disconnect(&self, reconnect: bool) -> Result<(), CableError> {
        let Some(identifier) = self.identified_by.connection_identifier() else {
            return Err(CableError::InvalidIdentifier(String::new()));
        };
        internal_channel::publish_disconnect(self.server.pubsub.as_ref(), &identifier, reconnect)?;
        Ok(())
    }
}

pub struct ServerBuilder {
    settings: Settings,
    pubsub: Option<Arc<dyn PubSubAdapter>>,
    channels: ChannelCatalog,
    handler: Arc<dyn ConnectionHandler>,
    pool: Option<WorkerPool>,
}

impl ServerBuilder {
    pub fn channel<C: Channel>(mut self, descriptor: ChannelDescriptor<C>) -> Self {
        self.channels.register(descriptor);
        self
    }

    pub fn connection_handler<H: ConnectionHandler>(mut self, handler: H) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Uses `pubsub` instead of building one from `settings.pubsub`.
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSubAdapter>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub async fn build(self) -> Result<Arc<Server>, CableError> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::new(self.settings.workers.pool_size),
        };
        let pubsub = match self.pubsub {
            Some(pubsub) => pubsub,
            None => broker::from_settings(&self.settings.pubsub, pool.clone()).await?,
        };
        info!(
            channels = ?self.channels.names(),
            adapter = pubsub.name(),
            workers = pool.size(),
            "server ready"
        );
        Ok(Arc::new(Server {
            settings: self.settings,
            pubsub,
            channels: Arc::new(self.channels),
            handler: self.handler,
            pool,
            connections: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
        }))
    }
}

#[cfg(test)]
mod tests;
