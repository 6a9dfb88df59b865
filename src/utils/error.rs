//! Error types shared across the crate.
//!
//! Errors are split by blast radius: `BrokerError` stays inside the pub/sub
//! layer, `ChannelError` is what user channel code returns, and `CableError`
//! covers everything a connection or the server can report.

use thiserror::Error;

/// Failures raised by a pub/sub backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("postgres pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("failed to create postgres pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    #[error("broker payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("payload of {0} bytes is too large for this broker")]
    PayloadTooLarge(usize),

    #[error("broker connection lost")]
    ConnectionLost,

    #[error("broker adapter `{0}` needs a `pubsub.url`")]
    MissingUrl(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures returned by channel hooks, actions and timers.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Message(String),

    #[error("invalid channel data: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ChannelError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Crate-level error for connections, the registry and the server.
#[derive(Debug, Error)]
pub enum CableError {
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returned by a connection's `connect` hook to refuse the client.
#[derive(Debug, Error)]
#[error("connection rejected: {reason}")]
pub struct ConnectionRejected {
    pub reason: String,
}

impl ConnectionRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
