//! Direct pub/sub backend over Redis `PUBLISH`/`SUBSCRIBE`.
//!
//! Publishing goes through a shared `ConnectionManager`. Redis delivers one
//! message per subscribed connection, so local fan-out to many callbacks is
//! still done by a [`NotifyListener`] whose session is a dedicated pub/sub
//! connection.

use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use tracing::{error, warn};

use crate::broker::adapter::{MessageCallback, PubSubAdapter, ReadyCallback};
use crate::broker::listener::{
    ListenerConfig, Notification, NotifyConnector, NotifyListener, NotifySession,
};
use crate::broker::naming::ChannelNaming;
use crate::config::PubSubSettings;
use crate::utils::error::BrokerError;
use crate::worker_pool::WorkerPool;

pub struct RedisAdapter {
    publisher: ConnectionManager,
    listener: NotifyListener,
    naming: ChannelNaming,
    handle: tokio::runtime::Handle,
}

impl RedisAdapter {
    pub async fn connect(settings: &PubSubSettings, workers: WorkerPool) -> Result<Self, BrokerError> {
        let url = settings.url.as_deref().ok_or(BrokerError::MissingUrl("redis"))?;
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        let listener = NotifyListener::new(
            RedisConnector { client },
            workers,
            ListenerConfig {
                thread_name: "popcable-redis-listener".to_string(),
                poll_timeout: Duration::from_millis(settings.poll_timeout_ms),
                reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            },
        );

        Ok(Self {
            publisher,
            listener,
            naming: ChannelNaming::new(settings.channel_prefix.clone()),
            handle: tokio::runtime::Handle::current(),
        })
    }
}

impl PubSubAdapter for RedisAdapter {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn broadcast(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let channel = self.naming.channel_for(topic);
        let payload = payload.to_string();
        let mut publisher = self.publisher.clone();

        self.handle.spawn(async move {
            let published: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(payload)
                .query_async(&mut publisher)
                .await;
            if let Err(e) = published {
                error!(channel = %channel, error = %e, "PUBLISH failed");
            }
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str, callback: MessageCallback, on_ready: Option<ReadyCallback>) {
        let channel = self.naming.channel_for(topic);
        self.listener.add_subscriber(&channel, callback, on_ready);
    }

    fn unsubscribe(&self, topic: &str, callback: &MessageCallback) {
        let channel = self.naming.channel_for(topic);
        self.listener.remove_subscriber(&channel, callback);
    }

    fn subscriber_count(&self) -> usize {
        self.listener.subscribers().callback_count()
    }

    fn shutdown(&self) {
        self.listener.shutdown();
    }
}

struct RedisConnector {
    client: redis::Client,
}

impl NotifyConnector for RedisConnector {
    fn connect(&mut self) -> Result<Box<dyn NotifySession>, BrokerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let pubsub = runtime.block_on(self.client.get_async_pubsub())?;
        Ok(Box::new(RedisSession { runtime, pubsub }))
    }
}

struct RedisSession {
    runtime: tokio::runtime::Runtime,
    pubsub: redis::aio::PubSub,
}

impl NotifySession for RedisSession {
    fn listen(&mut self, channel: &str) -> Result<(), BrokerError> {
        self.runtime.block_on(self.pubsub.subscribe(channel))?;
        Ok(())
    }

    fn unlisten(&mut self, channel: &str) -> Result<(), BrokerError> {
        self.runtime.block_on(self.pubsub.unsubscribe(channel))?;
        Ok(())
    }

    fn wait_for_notify(&mut self, timeout: Duration) -> Result<Option<Notification>, BrokerError> {
        let pubsub = &mut self.pubsub;
        let waited = self.runtime.block_on(async {
            tokio::time::timeout(timeout, pubsub.on_message().next()).await
        });
        match waited {
            Ok(Some(message)) => Ok(decode(&message)),
            Ok(None) => Err(BrokerError::ConnectionLost),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// A payload that is not UTF-8 is dropped; it says nothing about the
/// connection, which stays up for every other topic.
pub(super) fn decode(message: &redis::Msg) -> Option<Notification> {
    let channel = message.get_channel_name().to_string();
    match message.get_payload::<String>() {
        Ok(payload) => Some(Notification { channel, payload }),
        Err(e) => {
            warn!(channel = %channel, error = %e, "dropping undecodable redis payload");
            None
        }
    }
}
