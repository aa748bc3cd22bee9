//! Task queue persistence.
//!
//! Provides SQLite-backed operations on the `task_master` table: creation,
//! priority-ordered pending reads, the atomic claim used by workers, the
//! conditional assignment used by the pool manager, and the combined
//! complete-with-stats transaction that finalises a task and updates its
//! worker's counters in one step.
//!
//! Ordering is always `priority DESC, created_at ASC`, with the implicit
//! rowid as the stable tie-breaker so equal-priority tasks drain in
//! insertion order.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::Row;
use tracing::{debug, instrument, warn};

use crate::db::{immediate_tx, Database};
use crate::error::{StoreError, StoreResult};
use crate::types::{Task, TaskContent, TaskOutcome, TaskStatus};

const TASK_COLUMNS: &str =
    "task_id, content, status, priority, result, created_by, assigned_to, created_at, updated_at";

/// Operations on the durable task queue.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Create a new task store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new pending task.
    ///
    /// Returns `Ok(false)` if a task with the same id already exists.
    /// Priority must be within `[1, 10]`.
    #[instrument(skip(self, content))]
    pub async fn create(
        &self,
        task_id: &str,
        content: &TaskContent,
        priority: i64,
        created_by: &str,
    ) -> StoreResult<bool> {
        if !(1..=10).contains(&priority) {
            return Err(StoreError::InvalidArgument(format!(
                "priority {priority} outside [1, 10]"
            )));
        }

        let task_id = task_id.to_string();
        let content = serde_json::to_string(content)?;
        let created_by = created_by.to_string();

        let inserted = self
            .db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                let result = conn.execute(
                    "INSERT INTO task_master (task_id, content, status, priority, created_by, created_at, updated_at) \
                     VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
                    rusqlite::params![task_id, content, priority, created_by, now],
                );
                match result {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        warn!(task_id = %task_id, "task already exists");
                        Ok(false)
                    }
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await?;

        if inserted {
            debug!("task created");
        }
        Ok(inserted)
    }

    /// Fetch a single task by id, returning `None` if not found.
    #[instrument(skip(self))]
    pub async fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let task_id = task_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_master WHERE task_id = ?1"),
                    rusqlite::params![task_id],
                    map_task_row,
                );
                match result {
                    Ok(row) => row.into_task().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Up to `limit` pending tasks in dispatch order.
    #[instrument(skip(self))]
    pub async fn get_pending(&self, limit: i64) -> StoreResult<Vec<Task>> {
        self.list_where("status = 'pending'", limit).await
    }

    /// Up to `limit` in-progress tasks in dispatch order.
    #[instrument(skip(self))]
    pub async fn get_active(&self, limit: i64) -> StoreResult<Vec<Task>> {
        self.list_where("status = 'in_progress'", limit).await
    }

    /// Up to `limit` completed tasks, most recently finished first.
    #[instrument(skip(self))]
    pub async fn get_completed(&self, limit: i64) -> StoreResult<Vec<Task>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM task_master \
                     WHERE status = 'completed' ORDER BY updated_at DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_task()).collect()
            })
            .await
    }

    async fn list_where(&self, predicate: &'static str, limit: i64) -> StoreResult<Vec<Task>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM task_master WHERE {predicate} \
                     ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(|r| r.into_task()).collect()
            })
            .await
    }

    /// Atomically claim the top-of-queue pending task for `worker_id`.
    ///
    /// In a single immediate transaction: selects the highest-priority
    /// pending task, transitions it to `in_progress` with
    /// `assigned_to = worker_id`, and marks the worker row busy on it.
    /// Returns `None` when no pending task exists. Concurrent callers
    /// always receive disjoint tasks.
    #[instrument(skip(self))]
    pub async fn acquire_next(&self, worker_id: &str) -> StoreResult<Option<Task>> {
        let worker_id = worker_id.to_string();
        self.db
            .execute_retry(move |conn| {
                immediate_tx(conn, |conn| {
                    let candidate = conn.query_row(
                        &format!(
                            "SELECT {TASK_COLUMNS} FROM task_master WHERE status = 'pending' \
                             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT 1"
                        ),
                        [],
                        map_task_row,
                    );
                    let row = match candidate {
                        Ok(row) => row,
                        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                        Err(e) => return Err(StoreError::Sqlite(e)),
                    };

                    let now = Utc::now().timestamp();
                    let claimed = conn.execute(
                        "UPDATE task_master \
                         SET status = 'in_progress', assigned_to = ?1, updated_at = ?2 \
                         WHERE task_id = ?3 AND status = 'pending'",
                        rusqlite::params![worker_id, now, row.task_id],
                    )?;
                    if claimed == 0 {
                        // Another claimer won inside this transaction window.
                        return Ok(None);
                    }

                    conn.execute(
                        "UPDATE workers \
                         SET status = 'busy', current_task = ?1, last_heartbeat = ?2 \
                         WHERE worker_id = ?3",
                        rusqlite::params![row.task_id, now, worker_id],
                    )?;

                    let mut task = row.into_task()?;
                    task.status = TaskStatus::InProgress;
                    task.assigned_to = Some(worker_id.clone());
                    task.updated_at = now;
                    Ok(Some(task))
                })
            })
            .await
    }

    /// Conditional `pending → in_progress` transition used by the pool
    /// manager when pushing an assignment. Succeeds only if the task is
    /// still pending.
    #[instrument(skip(self))]
    pub async fn assign_to_worker(&self, task_id: &str, worker_id: &str) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();
        self.db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                let updated = conn.execute(
                    "UPDATE task_master \
                     SET status = 'in_progress', assigned_to = ?1, updated_at = ?2 \
                     WHERE task_id = ?3 AND status = 'pending'",
                    rusqlite::params![worker_id, now, task_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Finalise a task and update its worker's counters in one
    /// transaction.
    ///
    /// The transition is matched on `(task_id, assigned_to = worker_id,
    /// status = in_progress)`; anything else is a no-op returning
    /// `Ok(false)` with counters untouched. On success the worker row is
    /// reset to idle with a fresh heartbeat and the matching counter is
    /// incremented.
    #[instrument(skip(self, outcome))]
    pub async fn complete_with_stats(
        &self,
        task_id: &str,
        worker_id: &str,
        outcome: &TaskOutcome,
    ) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();
        let success = outcome.success;
        let result_blob = outcome.to_json()?;

        let finished = self
            .db
            .execute_retry(move |conn| {
                immediate_tx(conn, |conn| {
                    let now = Utc::now().timestamp();
                    let status = if success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };

                    let updated = conn.execute(
                        "UPDATE task_master \
                         SET status = ?1, result = ?2, updated_at = ?3 \
                         WHERE task_id = ?4 AND assigned_to = ?5 AND status = 'in_progress'",
                        rusqlite::params![status.as_str(), result_blob, now, task_id, worker_id],
                    )?;
                    if updated == 0 {
                        warn!(
                            task_id = %task_id,
                            worker_id = %worker_id,
                            "completion rejected: task not in progress for this worker"
                        );
                        return Ok(false);
                    }

                    let counter = if success {
                        "tasks_completed"
                    } else {
                        "tasks_failed"
                    };
                    conn.execute(
                        &format!(
                            "UPDATE workers \
                             SET {counter} = {counter} + 1, status = 'idle', \
                                 current_task = NULL, last_heartbeat = ?1 \
                             WHERE worker_id = ?2"
                        ),
                        rusqlite::params![now, worker_id],
                    )?;

                    Ok(true)
                })
            })
            .await?;

        if finished {
            debug!(success, "task finalised");
        }
        Ok(finished)
    }

    /// Unconditional status set, used by cancellation and orphan
    /// recovery. Returns `false` if the task does not exist.
    #[instrument(skip(self, outcome))]
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        outcome: Option<&TaskOutcome>,
    ) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        let result_blob = match outcome {
            Some(o) => Some(o.to_json()?),
            None => None,
        };

        self.db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                let updated = match &result_blob {
                    Some(blob) => conn.execute(
                        "UPDATE task_master SET status = ?1, result = ?2, updated_at = ?3 \
                         WHERE task_id = ?4",
                        rusqlite::params![status.as_str(), blob, now, task_id],
                    )?,
                    None => conn.execute(
                        "UPDATE task_master SET status = ?1, updated_at = ?2 WHERE task_id = ?3",
                        rusqlite::params![status.as_str(), now, task_id],
                    )?,
                };
                Ok(updated > 0)
            })
            .await
    }

    /// Number of tasks in the given status.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: TaskStatus) -> StoreResult<i64> {
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM task_master WHERE status = ?1",
                    rusqlite::params![status.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Task counts grouped by status.
    #[instrument(skip(self))]
    pub async fn statistics(&self) -> StoreResult<HashMap<String, i64>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM task_master GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Helper for worker processes: fetch a task only if it is currently
    /// assigned to `worker_id` and in progress.
    #[instrument(skip(self))]
    pub async fn get_assigned(
        &self,
        task_id: &str,
        worker_id: &str,
    ) -> StoreResult<Option<Task>> {
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM task_master \
                         WHERE task_id = ?1 AND assigned_to = ?2 AND status = 'in_progress'"
                    ),
                    rusqlite::params![task_id, worker_id],
                    map_task_row,
                );
                match result {
                    Ok(row) => row.into_task().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

/// Raw row data from SQLite before enum parsing.
///
/// Keeps the `rusqlite` row-mapping closure infallible beyond column
/// access; status parsing happens in a second step that can return
/// `StoreError::InvalidArgument`.
struct TaskRow {
    task_id: String,
    content: String,
    status: String,
    priority: i64,
    result: Option<String>,
    created_by: Option<String>,
    assigned_to: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        task_id: row.get(0)?,
        content: row.get(1)?,
        status: row.get(2)?,
        priority: row.get(3)?,
        result: row.get(4)?,
        created_by: row.get(5)?,
        assigned_to: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl TaskRow {
    fn into_task(self) -> StoreResult<Task> {
        Ok(Task {
            task_id: self.task_id,
            content: self.content,
            status: TaskStatus::parse(&self.status)?,
            priority: self.priority,
            result: self.result,
            created_by: self.created_by,
            assigned_to: self.assigned_to,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskOptions;

    async fn setup() -> TaskStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        TaskStore::new(db)
    }

    fn content(prompt: &str) -> TaskContent {
        TaskContent {
            task_type: "general".into(),
            prompt: prompt.into(),
            files: vec![],
            output_file: None,
            options: TaskOptions::default(),
            preferred_worker: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = setup().await;
        let created = store
            .create("t1", &content("hello"), 5, "tests")
            .await
            .unwrap();
        assert!(created);

        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert_eq!(task.assigned_to, None);
        assert_eq!(task.parsed_content().unwrap().prompt, "hello");
    }

    #[tokio::test]
    async fn duplicate_create_returns_false() {
        let store = setup().await;
        assert!(store.create("t1", &content("a"), 5, "tests").await.unwrap());
        assert!(!store.create("t1", &content("b"), 5, "tests").await.unwrap());
    }

    #[tokio::test]
    async fn priority_out_of_range_is_rejected() {
        let store = setup().await;
        assert!(store.create("t0", &content("a"), 0, "tests").await.is_err());
        assert!(store.create("t11", &content("a"), 11, "tests").await.is_err());
    }

    #[tokio::test]
    async fn pending_order_is_priority_then_age() {
        let store = setup().await;
        store.create("low", &content("a"), 2, "tests").await.unwrap();
        store.create("high", &content("b"), 9, "tests").await.unwrap();
        store.create("mid", &content("c"), 5, "tests").await.unwrap();
        store.create("high2", &content("d"), 9, "tests").await.unwrap();

        let pending = store.get_pending(10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "high2", "mid", "low"]);
    }

    #[tokio::test]
    async fn acquire_next_claims_top_task() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();
        store.create("t2", &content("b"), 9, "tests").await.unwrap();

        let claimed = store.acquire_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.task_id, "t2");
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.assigned_to.as_deref(), Some("w1"));

        // Queue now holds only t1.
        let pending = store.get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "t1");
    }

    #[tokio::test]
    async fn acquire_next_on_empty_queue_returns_none() {
        let store = setup().await;
        assert!(store.acquire_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assign_is_conditional_on_pending() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();

        assert!(store.assign_to_worker("t1", "w1").await.unwrap());
        // Second assignment must observe the task is no longer pending.
        assert!(!store.assign_to_worker("t1", "w2").await.unwrap());

        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.assigned_to.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn complete_rejects_wrong_worker() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();
        store.assign_to_worker("t1", "w1").await.unwrap();

        let outcome = TaskOutcome::ok("done");
        assert!(!store.complete_with_stats("t1", "w2", &outcome).await.unwrap());

        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn complete_is_not_repeatable() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();
        store.assign_to_worker("t1", "w1").await.unwrap();

        let outcome = TaskOutcome::ok("done");
        assert!(store.complete_with_stats("t1", "w1", &outcome).await.unwrap());
        // Already terminal: the second call is a no-op.
        assert!(!store.complete_with_stats("t1", "w1", &outcome).await.unwrap());
    }

    #[tokio::test]
    async fn failed_outcome_sets_failed_status() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();
        store.assign_to_worker("t1", "w1").await.unwrap();

        let outcome = TaskOutcome::err("model exploded");
        assert!(store.complete_with_stats("t1", "w1", &outcome).await.unwrap());

        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let parsed = task.parsed_result().unwrap().unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("model exploded"));
    }

    #[tokio::test]
    async fn update_status_is_unconditional() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();
        store.assign_to_worker("t1", "w1").await.unwrap();

        assert!(store
            .update_status("t1", TaskStatus::Cancelled, None)
            .await
            .unwrap());
        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        assert!(!store
            .update_status("missing", TaskStatus::Cancelled, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn statistics_group_by_status() {
        let store = setup().await;
        store.create("t1", &content("a"), 5, "tests").await.unwrap();
        store.create("t2", &content("b"), 5, "tests").await.unwrap();
        store.assign_to_worker("t2", "w1").await.unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.get("pending"), Some(&1));
        assert_eq!(stats.get("in_progress"), Some(&1));
        assert_eq!(store.count_by_status(TaskStatus::Pending).await.unwrap(), 1);
    }
}
