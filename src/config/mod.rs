//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, `config/default.toml`
//! (optional), then environment variables such as `POPCABLE__PUBSUB__ADAPTER`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    AdapterKind, HeartbeatSettings, LogSettings, PubSubSettings, ServerSettings, Settings,
    WorkerSettings,
};

/// Loads the configuration from the default file and environment variables
/// and merges it over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("POPCABLE").separator("__"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    merge(partial)
}

fn merge(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let default = Settings::default();
    let server = partial.server.unwrap_or_default();
    let pubsub = partial.pubsub.unwrap_or_default();
    let workers = partial.workers.unwrap_or_default();
    let heartbeat = partial.heartbeat.unwrap_or_default();
    let log = partial.log.unwrap_or_default();

    let adapter = match pubsub.adapter {
        Some(name) => name
            .parse::<AdapterKind>()
            .map_err(|bad| ConfigError::Message(format!("unknown pubsub adapter `{bad}`")))?,
        None => default.pubsub.adapter,
    };

    Ok(Settings {
        server: ServerSettings {
            host: server.host.unwrap_or(default.server.host),
            port: server.port.unwrap_or(default.server.port),
            allowed_origins: server
                .allowed_origins
                .map(|o| o.into_vec())
                .unwrap_or(default.server.allowed_origins),
        },
        pubsub: PubSubSettings {
            adapter,
            url: pubsub.url.or(default.pubsub.url),
            channel_prefix: pubsub
                .channel_prefix
                .filter(|p| !p.is_empty())
                .or(default.pubsub.channel_prefix),
            pool_size: pubsub.pool_size.unwrap_or(default.pubsub.pool_size),
            poll_timeout_ms: pubsub
                .poll_timeout_ms
                .unwrap_or(default.pubsub.poll_timeout_ms),
            reconnect_delay_ms: pubsub
                .reconnect_delay_ms
                .unwrap_or(default.pubsub.reconnect_delay_ms),
        },
        workers: WorkerSettings {
            pool_size: workers
                .pool_size
                .filter(|n| *n > 0)
                .unwrap_or(default.workers.pool_size),
        },
        heartbeat: HeartbeatSettings {
            interval_secs: heartbeat
                .interval_secs
                .unwrap_or(default.heartbeat.interval_secs),
        },
        log: LogSettings {
            level: log.level.unwrap_or(default.log.level),
        },
    })
}
