//! One client socket and everything hanging off it.
//!
//! A [`Connection`] is driven by the transport: `on_open` once after the
//! upgrade, `on_message` for every text frame in arrival order, and
//! `on_close` once at the end. The transport runs each of these on the
//! worker pool and waits for it before reading the next frame.

pub mod handle;
pub mod identity;
pub mod internal_channel;
pub mod subscriptions;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::MessageCallback;
use crate::server::Server;
use crate::transport::message::{ClientCommand, DisconnectReason, ServerMessage};
use crate::worker_pool::guarded;

pub use handle::ConnectionHandle;
pub use identity::{AllowAll, ConnectRequest, ConnectionHandler, IdentifiedBy};
pub use subscriptions::Subscriptions;

pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Open,
    Rejected,
    Closed,
}

/// Snapshot of a connection for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub request_id: Uuid,
    pub identifier: Option<String>,
    pub started_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
}

pub struct Connection {
    server: Arc<Server>,
    handle: ConnectionHandle,
    request: ConnectRequest,
    subscriptions: Subscriptions,
    state: ConnectionState,
    started_at: DateTime<Utc>,
    control: Option<(String, MessageCallback)>,
}

impl Connection {
    pub(crate) fn new(server: Arc<Server>, request: ConnectRequest, handle: ConnectionHandle) -> Self {
        let subscriptions = Subscriptions::new(
            handle.clone(),
            server.channels().clone(),
            server.pubsub().clone(),
            server.worker_pool().clone(),
        );
        Self {
            server,
            handle,
            request,
            subscriptions,
            state: ConnectionState::Pending,
            started_at: Utc::now(),
            control: None,
        }
    }

    /// Runs the connect hook. On success the connection joins its control
    /// topic and the client gets `welcome`; otherwise it gets an
    /// `unauthorized` disconnect and the socket is closed.
    pub fn on_open(&mut self) -> bool {
        if self.state != ConnectionState::Pending {
            return self.state == ConnectionState::Open;
        }

        let identified_by = match self.server.handler().connect(&self.request) {
            Ok(identified_by) => identified_by,
            Err(rejected) => {
                info!(connection = %self.handle.id(), reason = %rejected.reason, "connection rejected");
                self.handle
                    .transmit(ServerMessage::disconnect(DisconnectReason::Unauthorized, false));
                self.handle.close();
                self.state = ConnectionState::Rejected;
                return false;
            }
        };

        let identifier = self.handle.set_identity(identified_by).to_string();
        self.control = Some(internal_channel::subscribe(
            self.server.pubsub(),
            &self.handle,
            &identifier,
        ));
        self.state = ConnectionState::Open;
        self.handle.transmit(ServerMessage::Welcome);
        info!(connection = %self.handle.id(), identifier = %identifier, "connection opened");
        true
    }

    /// Decodes and executes one client command. Malformed input is logged
    /// and dropped; the connection stays open.
    pub fn on_message(&mut self, raw: &str) {
        if self.state != ConnectionState::Open {
            debug!(connection = %self.handle.id(), state = ?self.state, "ignoring message");
            return;
        }
        match serde_json::from_str::<ClientCommand>(raw) {
            Ok(command) => self.subscriptions.execute_command(command),
            Err(e) => warn!(connection = %self.handle.id(), error = %e, "dropping malformed command"),
        }
    }

    /// Tears everything down. Safe to call more than once.
    pub fn on_close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let was_open = self.state == ConnectionState::Open;
        self.state = ConnectionState::Closed;

        if let Some((topic, callback)) = self.control.take() {
            self.server.pubsub().unsubscribe(&topic, &callback);
        }
        self.subscriptions.unsubscribe_from_all();
        if was_open {
            if let Some(identified_by) = self.handle.identified_by() {
                let handler = self.server.handler();
                guarded("connection.disconnect", || handler.disconnect(identified_by));
            }
        }
        self.server.untrack(self.handle.id());
        self.handle.close();
        info!(connection = %self.handle.id(), "connection closed");
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn statistics(&self) -> ConnectionStats {
        ConnectionStats {
            request_id: self.handle.id(),
            identifier: self.handle.identifier().map(str::to_string),
            started_at: self.started_at,
            subscriptions: self.subscriptions.identifiers(),
        }
    }
}

#[cfg(test)]
mod tests;
