//! Shared state handed to every request handler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use atelier_store::{TaskStore, WorkerStore};

/// The `[api]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address, e.g. `127.0.0.1`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// TCP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a `sync=true` delegation waits for a terminal status.
    #[serde(default = "default_sync_timeout", with = "serde_secs")]
    pub sync_timeout: Duration,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            sync_timeout: default_sync_timeout(),
        }
    }
}

mod serde_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Application state shared across handlers.
pub struct ApiState {
    pub tasks: TaskStore,
    pub workers: WorkerStore,
    pub config: ApiConfig,
}
