//! # atelier-bus
//!
//! Pub/sub message bus for Atelier observers.
//!
//! The bus carries status notifications to external observers (dashboards,
//! log tails, bridge processes). It is **never** on the critical path for
//! task correctness — the store is authoritative — so every backend treats
//! publish failures as log-and-continue.
//!
//! Three backends are provided:
//!
//! - [`MemoryBus`] — process-local broadcast with a capped replay queue.
//! - [`RedisBus`] — Redis pub/sub plus a capped list per channel for
//!   durable replay.
//! - [`SpoolBus`] — one JSON file per event under a spool directory;
//!   consumers poll and delete. Used when no bus is configured.

pub mod error;
pub mod memory;
pub mod redis_bus;
pub mod spool;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{BusError, BusResult};
pub use memory::MemoryBus;
pub use redis_bus::RedisBus;
pub use spool::SpoolBus;

/// Maximum replayable messages retained per channel.
pub const REPLAY_CAP: usize = 1000;

/// Handler invoked once per message, in channel-arrival order.
///
/// Handlers run on a subscriber task, never on the publisher's, so a slow
/// handler cannot block publishing.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Pub/sub + durable replay queue abstraction.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Establish backend connections. Idempotent.
    async fn connect(&self) -> BusResult<()>;

    /// Tear down connections and stop subscriber tasks.
    async fn disconnect(&self) -> BusResult<()>;

    /// Fan a message out to `channel` subscribers and append it to the
    /// channel's replay queue. Best-effort and non-blocking.
    async fn publish(&self, channel: &str, message: &Value) -> BusResult<()>;

    /// Subscribe `handler` to `channel`.
    async fn subscribe(&self, channel: &str, handler: Handler) -> BusResult<()>;

    /// Remove the subscription for `channel`.
    async fn unsubscribe(&self, channel: &str) -> BusResult<()>;

    /// Number of messages currently held in the channel's replay queue.
    async fn queue_size(&self, channel: &str) -> BusResult<usize>;
}

/// Which bus backend to run, from the `[bus]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BusConfig {
    /// Process-local only.
    Memory,
    /// Durable remote bus with Redis semantics.
    Redis { url: String },
    /// File-per-event spool directory fallback.
    Spool { dir: std::path::PathBuf },
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig::Memory
    }
}

/// Build and connect the configured backend.
pub async fn connect(config: &BusConfig) -> BusResult<Arc<dyn MessageBus>> {
    let bus: Arc<dyn MessageBus> = match config {
        BusConfig::Memory => Arc::new(MemoryBus::new()),
        BusConfig::Redis { url } => Arc::new(RedisBus::new(url)),
        BusConfig::Spool { dir } => Arc::new(SpoolBus::new(dir.clone())),
    };
    bus.connect().await?;
    Ok(bus)
}

/// Stamp an outgoing message with the publish time.
///
/// Non-object payloads pass through unchanged.
pub(crate) fn stamped(message: &Value) -> Value {
    let mut message = message.clone();
    if let Some(map) = message.as_object_mut() {
        map.insert(
            "timestamp".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    message
}
