//! File-spool message bus fallback.
//!
//! Used when no bus is configured: each published event becomes one JSON
//! file under the spool directory, named so lexicographic order equals
//! publish order. Consumers poll the directory, deliver each file to the
//! handler, and delete it. Files are written to a temporary name and
//! renamed into place so a consumer never observes a half-written event.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::{stamped, Handler, MessageBus};

/// How often subscriber tasks poll the spool directory.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// File-per-event spool bus.
pub struct SpoolBus {
    dir: PathBuf,
    seq: AtomicU64,
    subscriptions: DashMap<String, JoinHandle<()>>,
}

impl SpoolBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
            subscriptions: DashMap::new(),
        }
    }

    /// The spool directory this bus writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn channel_prefix(channel: &str) -> String {
        // Double underscore separates channel from ordering key, so
        // channels containing underscores stay unambiguous.
        format!("{channel}__")
    }

    /// Sorted spool files for one channel.
    fn channel_files(dir: &Path, channel: &str) -> std::io::Result<Vec<PathBuf>> {
        let prefix = Self::channel_prefix(channel);
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "json")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Drain one channel: deliver every spooled event in order, deleting
    /// each file after its handler ran.
    fn drain(dir: &Path, channel: &str, handler: &Handler) {
        let files = match Self::channel_files(dir, channel) {
            Ok(files) => files,
            Err(err) => {
                warn!(channel, %err, "failed to read spool directory");
                return;
            }
        };

        for path in files {
            match std::fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => handler(value),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "discarding unparsable spool file")
                    }
                },
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read spool file");
                    continue;
                }
            }
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to delete consumed spool file");
            }
        }
    }
}

#[async_trait]
impl MessageBus for SpoolBus {
    async fn connect(&self) -> BusResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
        self.subscriptions.clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Value) -> BusResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let millis = chrono::Utc::now().timestamp_millis();
        let name = format!(
            "{}{millis:020}_{seq:06}.json",
            Self::channel_prefix(channel)
        );

        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{name}.tmp"));

        let payload = serde_json::to_vec(&stamped(message))?;
        std::fs::write(&tmp_path, payload)?;
        if let Err(err) = std::fs::rename(&tmp_path, &final_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(BusError::Io(err));
        }

        debug!(channel, file = %final_path.display(), "event spooled");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> BusResult<()> {
        let dir = self.dir.clone();
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                Self::drain(&dir, &channel_name, &handler);
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
        Ok(Self::channel_files(&self.dir, channel)?.len())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publish_writes_one_file_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SpoolBus::new(dir.path());
        bus.connect().await.unwrap();

        bus.publish("status", &json!({"seq": 0})).await.unwrap();
        bus.publish("status", &json!({"seq": 1})).await.unwrap();
        bus.publish("other", &json!({"seq": 2})).await.unwrap();

        assert_eq!(bus.queue_size("status").await.unwrap(), 2);
        assert_eq!(bus.queue_size("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subscriber_consumes_and_deletes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SpoolBus::new(dir.path());
        bus.connect().await.unwrap();

        for i in 0..3 {
            bus.publish("status", &json!({"seq": i})).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "status",
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
        )
        .await
        .unwrap();

        for expected in 0..3 {
            let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg["seq"], expected);
        }

        // Consumed events are gone from the spool.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(bus.queue_size("status").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn channels_with_underscores_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SpoolBus::new(dir.path());
        bus.connect().await.unwrap();

        bus.publish("task", &json!({"a": 1})).await.unwrap();
        bus.publish("task_status", &json!({"b": 2})).await.unwrap();

        assert_eq!(bus.queue_size("task").await.unwrap(), 1);
        assert_eq!(bus.queue_size("task_status").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn no_tmp_files_survive_publish() {
        let dir = tempfile::tempdir().unwrap();
        let bus = SpoolBus::new(dir.path());
        bus.connect().await.unwrap();
        bus.publish("status", &json!({"x": 1})).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
