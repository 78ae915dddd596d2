use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::client::resolver::Endpoint;

/// Top-level configuration settings for the application.
///
/// Every component receives the piece it needs at construction time; nothing
/// reads ambient configuration later on.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub local: EndpointSettings,
    /// `None` means local-only operation.
    pub remote: Option<EndpointSettings>,
    pub bus: BusSettings,
    pub sync: SyncSettings,
    pub server: ServerSettings,
}

/// Where a broker can be reached.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    pub host: String,
    pub port: u16,
    pub credential: Option<String>,
}

/// Configuration settings for the message bus.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    pub agent: String,
    pub log_key: String,
    pub realtime_channel: String,
    pub overflow_path: PathBuf,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Configuration settings for the sync daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    pub interval_ms: u64,
    pub batch_size: usize,
    pub block_ms: u64,
    pub retry_delay_ms: u64,
    pub state_key: String,
}

/// Configuration settings for the broker server.
///
/// Defines the address the WebSocket server binds to and where it keeps its log.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub data_path: PathBuf,
    pub credential: Option<String>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Any subset of fields may be given; missing values are filled from defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub local: Option<PartialEndpointSettings>,
    pub remote: Option<PartialEndpointSettings>,
    pub bus: Option<PartialBusSettings>,
    pub sync: Option<PartialSyncSettings>,
    pub server: Option<PartialServerSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialEndpointSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credential: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBusSettings {
    pub agent: Option<String>,
    pub log_key: Option<String>,
    pub realtime_channel: Option<String>,
    pub overflow_path: Option<PathBuf>,
    pub probe_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSyncSettings {
    pub interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub block_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub state_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_path: Option<PathBuf>,
    pub credential: Option<String>,
}

pub const DEFAULT_PORT: u16 = 7379;

impl Default for Settings {
    fn default() -> Self {
        Self {
            local: EndpointSettings {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_PORT,
                credential: None,
            },
            remote: None,
            bus: BusSettings {
                agent: "unknown".to_string(),
                log_key: "bicameral:stream:collab".to_string(),
                realtime_channel: "bicameral:realtime".to_string(),
                overflow_path: PathBuf::from(".bicameral/failed_messages.jsonl"),
                probe_timeout_ms: 3000,
                poll_interval_ms: 1000,
            },
            sync: SyncSettings {
                interval_ms: 2000,
                batch_size: 100,
                block_ms: 1000,
                retry_delay_ms: 5000,
                state_key: "sync:state".to_string(),
            },
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_PORT,
                data_path: PathBuf::from(".bicameral/broker.db"),
                credential: None,
            },
        }
    }
}

impl Settings {
    /// Fill every missing value of `partial` from the defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();

        let local = partial.local.unwrap_or_default();
        let bus = partial.bus.unwrap_or_default();
        let sync = partial.sync.unwrap_or_default();
        let server = partial.server.unwrap_or_default();

        Settings {
            local: EndpointSettings {
                host: local.host.unwrap_or(default.local.host),
                port: local.port.unwrap_or(default.local.port),
                credential: local.credential.or(default.local.credential),
            },
            // a remote without a host is not a remote
            remote: partial.remote.and_then(|r| {
                r.host.map(|host| EndpointSettings {
                    host,
                    port: r.port.unwrap_or(DEFAULT_PORT),
                    credential: r.credential,
                })
            }),
            bus: BusSettings {
                agent: bus.agent.unwrap_or(default.bus.agent),
                log_key: bus.log_key.unwrap_or(default.bus.log_key),
                realtime_channel: bus.realtime_channel.unwrap_or(default.bus.realtime_channel),
                overflow_path: bus.overflow_path.unwrap_or(default.bus.overflow_path),
                probe_timeout_ms: bus.probe_timeout_ms.unwrap_or(default.bus.probe_timeout_ms),
                poll_interval_ms: bus.poll_interval_ms.unwrap_or(default.bus.poll_interval_ms),
            },
            sync: SyncSettings {
                interval_ms: sync.interval_ms.unwrap_or(default.sync.interval_ms),
                batch_size: sync.batch_size.unwrap_or(default.sync.batch_size),
                block_ms: sync.block_ms.unwrap_or(default.sync.block_ms),
                retry_delay_ms: sync.retry_delay_ms.unwrap_or(default.sync.retry_delay_ms),
                state_key: sync.state_key.unwrap_or(default.sync.state_key),
            },
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                data_path: server.data_path.unwrap_or(default.server.data_path),
                credential: server.credential.or(default.server.credential),
            },
        }
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local.to_endpoint("local", 0)
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote.as_ref().map(|r| r.to_endpoint("remote", 1))
    }

    /// Local first, then remote when configured.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = vec![self.local_endpoint()];
        endpoints.extend(self.remote_endpoint());
        endpoints
    }
}

impl EndpointSettings {
    pub fn to_endpoint(&self, name: &str, priority: u8) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            host: self.host.clone(),
            port: self.port,
            credential: self.credential.clone(),
            priority,
        }
    }
}

impl BusSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
