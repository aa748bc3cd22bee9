//! Process-local message bus.
//!
//! Each channel pairs a `tokio::sync::broadcast` sender for live fan-out
//! with a capped replay queue. Subscribers run on their own spawned task;
//! a subscriber that falls more than the broadcast capacity behind skips
//! the overrun (drop-oldest) and keeps consuming.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::{stamped, Handler, MessageBus, REPLAY_CAP};

struct Channel {
    tx: broadcast::Sender<Value>,
    replay: Mutex<VecDeque<Value>>,
}

impl Channel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(REPLAY_CAP);
        Self {
            tx,
            replay: Mutex::new(VecDeque::with_capacity(64)),
        }
    }
}

/// In-memory pub/sub with per-channel replay.
pub struct MemoryBus {
    channels: DashMap<String, Channel>,
    subscriptions: DashMap<String, JoinHandle<()>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Snapshot of the replay queue, oldest first. Test hook and
    /// debugging aid.
    pub fn replay(&self, channel: &str) -> Vec<Value> {
        self.channels
            .get(channel)
            .map(|c| {
                c.replay
                    .lock()
                    .map(|q| q.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self) -> BusResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
        self.subscriptions.clear();
        self.channels.clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Value) -> BusResult<()> {
        let message = stamped(message);
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);

        if let Ok(mut replay) = entry.replay.lock() {
            if replay.len() >= REPLAY_CAP {
                replay.pop_front();
            }
            replay.push_back(message.clone());
        }

        // No receivers is fine; the replay queue already has the message.
        let _ = entry.tx.send(message);
        debug!(channel, "message published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> BusResult<()> {
        let mut rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new)
            .tx
            .subscribe();

        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "subscriber lagged, dropping oldest");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.subscriptions.insert(channel.to_string(), task) {
            previous.abort();
        }
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
        Ok(self
            .channels
            .get(channel)
            .map(|c| c.replay.lock().map(|q| q.len()).unwrap_or(0))
            .unwrap_or(0))
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(
            "status",
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
        )
        .await
        .unwrap();

        for i in 0..5 {
            bus.publish("status", &json!({"seq": i})).await.unwrap();
        }

        for expected in 0..5 {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg["seq"], expected);
            assert!(msg["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn replay_queue_is_capped() {
        let bus = MemoryBus::new();
        for i in 0..(REPLAY_CAP + 10) {
            bus.publish("flood", &json!({"seq": i})).await.unwrap();
        }

        assert_eq!(bus.queue_size("flood").await.unwrap(), REPLAY_CAP);
        // Oldest entries were dropped.
        let replay = bus.replay("flood");
        assert_eq!(replay.first().unwrap()["seq"], 10);
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = MemoryBus::new();
        bus.publish("nobody", &json!({"ok": true})).await.unwrap();
        assert_eq!(bus.queue_size("nobody").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_channel_errors() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.unsubscribe("ghost").await,
            Err(BusError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn queue_size_of_unknown_channel_is_zero() {
        let bus = MemoryBus::new();
        assert_eq!(bus.queue_size("ghost").await.unwrap(), 0);
    }
}
