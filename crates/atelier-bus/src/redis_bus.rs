//! Redis-backed message bus.
//!
//! Publish fans out over Redis pub/sub and appends to a capped list
//! (`queue:<channel>`, newest first, trimmed to the replay cap) so late
//! consumers can inspect recent history. Each subscription runs a
//! dedicated pub/sub connection on its own task.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};
use crate::{stamped, Handler, MessageBus, REPLAY_CAP};

/// Durable remote bus with Redis semantics.
pub struct RedisBus {
    url: String,
    manager: Mutex<Option<ConnectionManager>>,
    subscriptions: DashMap<String, JoinHandle<()>>,
}

impl RedisBus {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            manager: Mutex::new(None),
            subscriptions: DashMap::new(),
        }
    }

    async fn connection(&self) -> BusResult<ConnectionManager> {
        self.manager
            .lock()
            .await
            .clone()
            .ok_or(BusError::NotConnected)
    }

    fn queue_key(channel: &str) -> String {
        format!("queue:{channel}")
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn connect(&self) -> BusResult<()> {
        let mut guard = self.manager.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let client = redis::Client::open(self.url.as_str())?;
        let manager = client.get_connection_manager().await?;
        *guard = Some(manager);
        info!(url = %self.url, "connected to redis bus");
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
        self.subscriptions.clear();
        *self.manager.lock().await = None;
        info!("disconnected from redis bus");
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Value) -> BusResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&stamped(message))?;

        let _: () = conn.publish(channel, &payload).await?;

        // Durable replay: newest at the head, trimmed to the cap.
        let key = Self::queue_key(channel);
        let _: () = conn.lpush(&key, &payload).await?;
        let _: () = conn.ltrim(&key, 0, (REPLAY_CAP as isize) - 1).await?;

        debug!(channel, "message published to redis");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> BusResult<()> {
        // Pub/sub needs its own dedicated connection.
        let client = redis::Client::open(self.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(channel = %channel_name, %err, "unreadable redis payload");
                        continue;
                    }
                };
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => handler(value),
                    Err(err) => {
                        warn!(channel = %channel_name, %err, "non-JSON message dropped");
                    }
                }
            }
            debug!(channel = %channel_name, "redis subscription stream ended");
        });

        if let Some(previous) = self.subscriptions.insert(channel.to_string(), task) {
            previous.abort();
        }
        info!(channel, "subscribed to redis channel");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> BusResult<()> {
        match self.subscriptions.remove(channel) {
            Some((_, task)) => {
                task.abort();
                Ok(())
            }
            None => Err(BusError::NotSubscribed(channel.to_string())),
        }
    }

    async fn queue_size(&self, channel: &str) -> BusResult<usize> {
        let mut conn = self.connection().await?;
        let len: i64 = conn.llen(Self::queue_key(channel)).await?;
        Ok(len.max(0) as usize)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_are_namespaced() {
        assert_eq!(RedisBus::queue_key("task_status"), "queue:task_status");
    }

    #[tokio::test]
    async fn operations_before_connect_fail_cleanly() {
        let bus = RedisBus::new("redis://127.0.0.1:1/");
        let result = bus.publish("c", &serde_json::json!({})).await;
        assert!(matches!(result, Err(BusError::NotConnected)));
    }
}
