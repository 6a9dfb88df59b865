//! Per-connection control topic, used to act on a connection from any
//! process that shares the broker.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::{MessageCallback, PubSubAdapter};
use crate::connection::ConnectionHandle;
use crate::transport::message::{ControlMessage, DisconnectReason, ServerMessage};
use crate::utils::error::BrokerError;

pub fn control_topic(connection_identifier: &str) -> String {
    format!("control/{connection_identifier}")
}

/// Asks every connection identified as `connection_identifier` to close.
pub fn publish_disconnect(
    pubsub: &dyn PubSubAdapter,
    connection_identifier: &str,
    reconnect: bool,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_string(&ControlMessage::disconnect(reconnect))?;
    pubsub.broadcast(&control_topic(connection_identifier), &payload)
}

pub(crate) fn subscribe(
    pubsub: &Arc<dyn PubSubAdapter>,
    handle: &ConnectionHandle,
    connection_identifier: &str,
) -> (String, MessageCallback) {
    let topic = control_topic(connection_identifier);
    let target = handle.clone();
    let callback = MessageCallback::new(move |payload| {
        let message: ControlMessage = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %target.id(), error = %e, "invalid control message");
                return;
            }
        };
        match message.kind.as_str() {
            ControlMessage::DISCONNECT => {
                info!(connection = %target.id(), reconnect = message.reconnect, "remote disconnect requested");
                target.transmit(ServerMessage::disconnect(DisconnectReason::Remote, message.reconnect));
                target.close();
            }
            other => warn!(connection = %target.id(), kind = other, "unknown control message"),
        }
    });
    pubsub.subscribe(&topic, callback.clone(), None);
    (topic, callback)
}
