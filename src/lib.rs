//! # PopCable
//!
//! `popcable` multiplexes many channel subscriptions over one WebSocket per
//! client and fans broadcasts out through a pluggable pub/sub broker, so
//! several server processes can serve the same channels.
//!
//! ## Core Modules
//!
//! - `broker`: the pub/sub adapter trait and its memory, redis and postgres
//!   backends.
//! - `channel`: the `Channel` trait, channel descriptors and per-subscription
//!   instances.
//! - `connection`: one client socket, its subscriptions and its control topic.
//! - `server`: the shared server object: heartbeat, remote connections,
//!   shutdown.
//! - `transport`: the wire protocol and the WebSocket listener.
//! - `client`: connection-health monitor and a reconnecting consumer.
//! - `config`: layered settings loading.
//! - `worker_pool`: the bounded pool all user code runs on.
//! - `utils`: errors and logging.

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod server;
pub mod transport;
pub mod utils;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{Channel, ChannelContext, ChannelDescriptor};
pub use connection::{ConnectRequest, ConnectionHandler, IdentifiedBy};
pub use server::Server;
