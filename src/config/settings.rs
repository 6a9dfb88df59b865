use serde::Deserialize;

/// Top-level configuration for a cable server process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub pubsub: PubSubSettings,
    pub workers: WorkerSettings,
    pub heartbeat: HeartbeatSettings,
    pub log: LogSettings,
}

/// Where the WebSocket listener binds and which origins may connect.
///
/// An empty `allowed_origins` list disables the origin check.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

/// Broker backend selection.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Memory,
    Redis,
    Postgres,
}

impl std::str::FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "async" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(other.to_string()),
        }
    }
}

/// Backend-specific broker parameters.
///
/// `url` is the redis URL for the redis adapter and the connection string for
/// the postgres adapter; the memory adapter ignores it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PubSubSettings {
    pub adapter: AdapterKind,
    pub url: Option<String>,
    pub channel_prefix: Option<String>,
    pub pool_size: usize,
    pub poll_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WorkerSettings {
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration as read from files or the environment.
///
/// Every field is optional; `load_config` fills the gaps from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub pubsub: Option<PartialPubSubSettings>,
    pub workers: Option<PartialWorkerSettings>,
    pub heartbeat: Option<PartialHeartbeatSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub allowed_origins: Option<OneOrMany>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPubSubSettings {
    pub adapter: Option<String>,
    pub url: Option<String>,
    pub channel_prefix: Option<String>,
    pub pool_size: Option<usize>,
    pub poll_timeout_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWorkerSettings {
    pub pool_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialHeartbeatSettings {
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Origins arrive as a TOML array from files but as a comma separated string
/// from the environment.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum OneOrMany {
    Many(Vec<String>),
    One(String),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::Many(list) => list,
            OneOrMany::One(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                allowed_origins: Vec::new(),
            },
            pubsub: PubSubSettings {
                adapter: AdapterKind::Memory,
                url: None,
                channel_prefix: None,
                pool_size: 4,
                poll_timeout_ms: 500,
                reconnect_delay_ms: 1000,
            },
            workers: WorkerSettings { pool_size: 4 },
            heartbeat: HeartbeatSettings { interval_secs: 3 },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
