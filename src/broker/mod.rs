//! Pub/sub broker adapters.
//!
//! Every cross-connection and cross-process broadcast flows through a
//! [`PubSubAdapter`]. Three backends are provided:
//!
//! - `memory`: in-process fan-out, no network.
//! - `redis`: direct broker pub/sub.
//! - `postgres`: notify-poll over `LISTEN`/`NOTIFY` with a dedicated
//!   listener thread and command queue.

pub mod adapter;
pub mod listener;
pub mod memory;
pub mod naming;
pub mod postgres;
pub mod redis;
pub mod subscriber_map;

use std::sync::Arc;

use tracing::info;

use crate::config::{AdapterKind, PubSubSettings};
use crate::utils::error::BrokerError;
use crate::worker_pool::WorkerPool;

pub use adapter::{MessageCallback, PubSubAdapter, ReadyCallback};
pub use memory::MemoryAdapter;
pub use subscriber_map::SubscriberMap;

/// Builds the adapter selected by `settings.adapter`.
pub async fn from_settings(
    settings: &PubSubSettings,
    workers: WorkerPool,
) -> Result<Arc<dyn PubSubAdapter>, BrokerError> {
    let adapter: Arc<dyn PubSubAdapter> = match settings.adapter {
        AdapterKind::Memory => Arc::new(MemoryAdapter::new(workers)),
        AdapterKind::Redis => Arc::new(self::redis::RedisAdapter::connect(settings, workers).await?),
        AdapterKind::Postgres => Arc::new(self::postgres::PostgresAdapter::new(settings, workers)?),
    };
    info!(adapter = adapter.name(), "pubsub adapter ready");
    Ok(adapter)
}
