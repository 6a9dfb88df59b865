use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands a client sends over its socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "command")]
pub enum ClientCommand {
    #[serde(rename = "subscribe")]
    Subscribe { identifier: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { identifier: String },

    /// `data` is usually a JSON-encoded string carrying an `action` key, but
    /// a plain object is accepted too.
    #[serde(rename = "message")]
    Message {
        identifier: String,
        #[serde(default)]
        data: Value,
    },
}

impl ClientCommand {
    /// Decoded `data` of a `message` command, as an object.
    pub fn data_object(data: &Value) -> Result<Value, serde_json::Error> {
        match data {
            Value::String(encoded) => serde_json::from_str(encoded),
            other => Ok(other.clone()),
        }
    }
}

/// Control messages the server sends.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome,

    #[serde(rename = "ping")]
    Ping { message: i64 },

    #[serde(rename = "confirm_subscription")]
    ConfirmSubscription { identifier: String },

    #[serde(rename = "rejection")]
    Rejection { identifier: String },

    #[serde(rename = "confirm_unsubscription")]
    ConfirmUnsubscription { identifier: String },

    #[serde(rename = "disconnect")]
    Disconnect { reason: String, reconnect: bool },
}

impl ServerMessage {
    pub fn disconnect(reason: DisconnectReason, reconnect: bool) -> Self {
        ServerMessage::Disconnect {
            reason: reason.as_str().to_string(),
            reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unauthorized,
    Remote,
    ServerRestart,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Unauthorized => "unauthorized",
            DisconnectReason::Remote => "remote",
            DisconnectReason::ServerRestart => "server_restart",
        }
    }
}

/// Channel data addressed to one subscription.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Broadcast {
    pub identifier: String,
    pub message: Value,
}

/// Anything the server writes to a socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Control(ServerMessage),
    Broadcast(Broadcast),
}

impl From<ServerMessage> for Frame {
    fn from(message: ServerMessage) -> Self {
        Frame::Control(message)
    }
}

impl From<Broadcast> for Frame {
    fn from(broadcast: Broadcast) -> Self {
        Frame::Broadcast(broadcast)
    }
}

/// Sent over a connection's control topic by [`crate::server::RemoteConnections`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reconnect: bool,
}

impl ControlMessage {
    pub const DISCONNECT: &'static str = "disconnect";

    pub fn disconnect(reconnect: bool) -> Self {
        Self {
            kind: Self::DISCONNECT.to_string(),
            reconnect,
        }
    }
}
