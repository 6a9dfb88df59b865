//! Notify-poll backend over PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! Broadcasts go out through a `deadpool-postgres` pool with `pg_notify`.
//! Subscriptions are served by a [`NotifyListener`] thread holding its own
//! dedicated connection, driven by a private current-thread runtime.

use std::time::Duration;

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, warn};

use crate::broker::adapter::{MessageCallback, PubSubAdapter, ReadyCallback};
use crate::broker::listener::{
    ListenerConfig, Notification, NotifyConnector, NotifyListener, NotifySession,
};
use crate::broker::naming::ChannelNaming;
use crate::config::PubSubSettings;
use crate::utils::error::BrokerError;
use crate::worker_pool::WorkerPool;

/// Longest identifier postgres keeps without truncating.
pub const MAX_CHANNEL_LEN: usize = 63;

/// `NOTIFY` payloads must stay below 8000 bytes.
pub const MAX_PAYLOAD_LEN: usize = 7999;

pub struct PostgresAdapter {
    pool: Pool,
    listener: NotifyListener,
    naming: ChannelNaming,
    handle: tokio::runtime::Handle,
}

impl PostgresAdapter {
    /// Must be called from within a tokio runtime; broadcasts are sent from it.
    pub fn new(settings: &PubSubSettings, workers: WorkerPool) -> Result<Self, BrokerError> {
        let url = settings
            .url
            .clone()
            .ok_or(BrokerError::MissingUrl("postgres"))?;

        let mut config = Config::new();
        config.url = Some(url.clone());
        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        config.pool = Some(PoolConfig::new(settings.pool_size.max(1)));
        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        let listener = NotifyListener::new(
            PostgresConnector { url },
            workers,
            ListenerConfig {
                thread_name: "popcable-pg-listener".to_string(),
                poll_timeout: Duration::from_millis(settings.poll_timeout_ms),
                reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            },
        );

        Ok(Self {
            pool,
            listener,
            naming: ChannelNaming::new(settings.channel_prefix.clone())
                .with_max_len(MAX_CHANNEL_LEN),
            handle: tokio::runtime::Handle::current(),
        })
    }
}

impl PubSubAdapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn broadcast(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(BrokerError::PayloadTooLarge(payload.len()));
        }
        let channel = self.naming.channel_for(topic);
        let payload = payload.to_string();
        let pool = self.pool.clone();

        self.handle.spawn(async move {
            let client = match pool.get().await {
                Ok(client) => client,
                Err(e) => {
                    error!(channel = %channel, error = %e, "no connection available for NOTIFY");
                    return;
                }
            };
            if let Err(e) = client
                .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
                .await
            {
                error!(channel = %channel, error = %e, "NOTIFY failed");
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

struct PostgresConnector {
    url: String,
}

impl NotifyConnector for PostgresConnector {
    fn connect(&mut self) -> Result<Box<dyn NotifySession>, BrokerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (client, mut connection) = runtime.block_on(tokio_postgres::connect(&self.url, NoTls))?;

        // The connection future only makes progress while the session is
        // inside `block_on`, which is exactly when we want notifications.
        let (tx, notifications) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let notification = Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice, "postgres notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "postgres listener connection failed");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(PostgresSession {
            runtime,
            client,
            notifications,
        }))
    }
}

struct PostgresSession {
    runtime: tokio::runtime::Runtime,
    client: Client,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl NotifySession for PostgresSession {
    fn listen(&mut self, channel: &str) -> Result<(), BrokerError> {
        let statement = format!("LISTEN {}", quote_ident(channel));
        self.runtime.block_on(self.client.batch_execute(&statement))?;
        Ok(())
    }

    fn unlisten(&mut self, channel: &str) -> Result<(), BrokerError> {
        let statement = format!("UNLISTEN {}", quote_ident(channel));
        self.runtime.block_on(self.client.batch_execute(&statement))?;
        Ok(())
    }

    fn wait_for_notify(&mut self, timeout: Duration) -> Result<Option<Notification>, BrokerError> {
        let notifications = &mut self.notifications;
        let waited = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, notifications.recv()).await });
        match waited {
            Ok(Some(notification)) => Ok(Some(notification)),
            Ok(None) => Err(BrokerError::ConnectionLost),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Quotes `name` as a SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
