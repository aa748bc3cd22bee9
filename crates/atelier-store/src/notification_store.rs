//! Durable pool-manager → worker notifications.
//!
//! Assignment notifications are queued through the store rather than an
//! in-memory channel so a worker restart never loses one. Rows are
//! marked processed on claim but kept for the worker's lifetime, which
//! lets duplicate consumers converge instead of double-claiming.

use chrono::Utc;
use rusqlite::Row;
use tracing::{debug, instrument};

use crate::db::{immediate_tx, Database};
use crate::error::StoreResult;
use crate::types::{Notification, NotificationKind};

/// Operations on the durable notification queue.
#[derive(Clone)]
pub struct NotificationStore {
    db: Database,
}

impl NotificationStore {
    /// Create a new notification store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue a notification for `worker_id`. Returns the row id.
    #[instrument(skip(self, message))]
    pub async fn enqueue(
        &self,
        worker_id: &str,
        kind: NotificationKind,
        task_id: Option<&str>,
        message: Option<&str>,
    ) -> StoreResult<i64> {
        let worker_id = worker_id.to_string();
        let task_id = task_id.map(|s| s.to_string());
        let message = message.map(|s| s.to_string());

        let id = self
            .db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                conn.execute(
                    "INSERT INTO worker_notifications \
                     (worker_id, notification_type, task_id, message, processed, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                    rusqlite::params![worker_id, kind.as_str(), task_id, message, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(id, "notification enqueued");
        Ok(id)
    }

    /// Atomically claim every unprocessed notification addressed to
    /// `worker_id`, oldest first. Claimed rows are marked processed in
    /// the same transaction that reads them, so two racing consumers of
    /// the same worker id never both observe a notification.
    #[instrument(skip(self))]
    pub async fn claim(&self, worker_id: &str) -> StoreResult<Vec<Notification>> {
        let worker_id = worker_id.to_string();
        self.db
            .execute_retry(move |conn| {
                immediate_tx(conn, |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id, worker_id, notification_type, task_id, message, processed, created_at \
                         FROM worker_notifications \
                         WHERE worker_id = ?1 AND processed = 0 \
                         ORDER BY created_at ASC, id ASC",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![worker_id], map_notification_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    drop(stmt);

                    let mut notifications = Vec::with_capacity(rows.len());
                    for row in rows {
                        conn.execute(
                            "UPDATE worker_notifications SET processed = 1 WHERE id = ?1",
                            rusqlite::params![row.id],
                        )?;
                        let mut notification = row.into_notification()?;
                        notification.processed = true;
                        notifications.push(notification);
                    }
                    Ok(notifications)
                })
            })
            .await
    }

    /// Number of unprocessed notifications waiting for `worker_id`.
    #[instrument(skip(self))]
    pub async fn pending_count(&self, worker_id: &str) -> StoreResult<i64> {
        let worker_id = worker_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM worker_notifications \
                     WHERE worker_id = ?1 AND processed = 0",
                    rusqlite::params![worker_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct NotificationRow {
    id: i64,
    worker_id: String,
    kind: String,
    task_id: Option<String>,
    message: Option<String>,
    processed: i64,
    created_at: i64,
}

fn map_notification_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        kind: row.get(2)?,
        task_id: row.get(3)?,
        message: row.get(4)?,
        processed: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl NotificationRow {
    fn into_notification(self) -> StoreResult<Notification> {
        Ok(Notification {
            id: self.id,
            worker_id: self.worker_id,
            kind: NotificationKind::parse(&self.kind)?,
            task_id: self.task_id,
            message: self.message,
            processed: self.processed != 0,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> NotificationStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        NotificationStore::new(db)
    }

    #[tokio::test]
    async fn enqueue_and_claim_in_order() {
        let store = setup().await;
        store
            .enqueue("w1", NotificationKind::TaskAssigned, Some("t1"), None)
            .await
            .unwrap();
        store
            .enqueue(
                "w1",
                NotificationKind::TaskAssigned,
                Some("t2"),
                Some("process immediately"),
            )
            .await
            .unwrap();

        assert_eq!(store.pending_count("w1").await.unwrap(), 2);

        let claimed = store.claim("w1").await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].task_id.as_deref(), Some("t1"));
        assert_eq!(claimed[1].task_id.as_deref(), Some("t2"));
        assert!(claimed.iter().all(|n| n.processed));
    }

    #[tokio::test]
    async fn claim_is_exhaustive() {
        let store = setup().await;
        store
            .enqueue("w1", NotificationKind::TaskAssigned, Some("t1"), None)
            .await
            .unwrap();

        assert_eq!(store.claim("w1").await.unwrap().len(), 1);
        // Marked processed: a second claim sees nothing.
        assert!(store.claim("w1").await.unwrap().is_empty());
        assert_eq!(store.pending_count("w1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_only_sees_own_notifications() {
        let store = setup().await;
        store
            .enqueue("w1", NotificationKind::TaskAssigned, Some("t1"), None)
            .await
            .unwrap();
        store
            .enqueue("w2", NotificationKind::TaskAssigned, Some("t2"), None)
            .await
            .unwrap();

        let claimed = store.claim("w1").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].worker_id, "w1");
        assert_eq!(store.pending_count("w2").await.unwrap(), 1);
    }
}
