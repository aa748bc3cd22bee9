//! Worker registry and liveness tracking.
//!
//! Workers register on process start (overwriting any stale row with the
//! same id), prove liveness through heartbeat writes, and are reclaimed
//! by [`WorkerStore::cleanup_dead`] which atomically releases their
//! orphaned tasks back to pending before deleting the rows.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Row;
use tracing::{debug, info, instrument};

use crate::db::{immediate_tx, Database};
use crate::error::{StoreError, StoreResult};
use crate::types::{Worker, WorkerLocation, WorkerStatus};

const WORKER_COLUMNS: &str = "worker_id, status, current_task, tasks_completed, tasks_failed, \
     last_heartbeat, created_at, location, performance_factor, endpoint_url";

/// A worker's registration profile.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub location: WorkerLocation,
    pub performance_factor: f64,
    pub endpoint_url: Option<String>,
}

impl Default for WorkerProfile {
    fn default() -> Self {
        Self {
            location: WorkerLocation::Local,
            performance_factor: 1.0,
            endpoint_url: None,
        }
    }
}

impl WorkerProfile {
    /// Profile for a remote worker reachable at `endpoint_url`.
    pub fn remote(endpoint_url: impl Into<String>, performance_factor: f64) -> Self {
        Self {
            location: WorkerLocation::Remote,
            performance_factor,
            endpoint_url: Some(endpoint_url.into()),
        }
    }
}

/// Operations on the worker registry.
#[derive(Clone)]
pub struct WorkerStore {
    db: Database,
}

impl WorkerStore {
    /// Create a new worker store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a worker, replacing any stale row with the same id.
    ///
    /// The row starts idle with zeroed counters and a fresh heartbeat.
    #[instrument(skip(self, profile))]
    pub async fn register(&self, worker_id: &str, profile: &WorkerProfile) -> StoreResult<()> {
        let worker_id = worker_id.to_string();
        let location = profile.location;
        let performance_factor = profile.performance_factor;
        let endpoint_url = profile.endpoint_url.clone();

        self.db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                conn.execute(
                    "INSERT OR REPLACE INTO workers \
                     (worker_id, status, current_task, tasks_completed, tasks_failed, \
                      last_heartbeat, created_at, location, performance_factor, endpoint_url) \
                     VALUES (?1, 'idle', NULL, 0, 0, ?2, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        worker_id,
                        now,
                        location.as_str(),
                        performance_factor,
                        endpoint_url
                    ],
                )?;
                Ok(())
            })
            .await?;

        info!("worker registered");
        Ok(())
    }

    /// Fetch a single worker row.
    #[instrument(skip(self))]
    pub async fn get(&self, worker_id: &str) -> StoreResult<Option<Worker>> {
        let worker_id = worker_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1"),
                    rusqlite::params![worker_id],
                    map_worker_row,
                );
                match result {
                    Ok(row) => row.into_worker().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Set a worker's status (and optionally its current task), refreshing
    /// the heartbeat. Returns `false` if the worker row does not exist.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        current_task: Option<&str>,
    ) -> StoreResult<bool> {
        let worker_id = worker_id.to_string();
        let current_task = current_task.map(|s| s.to_string());
        self.db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                let updated = conn.execute(
                    "UPDATE workers \
                     SET status = ?1, current_task = ?2, last_heartbeat = ?3 \
                     WHERE worker_id = ?4",
                    rusqlite::params![status.as_str(), current_task, now, worker_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Refresh a worker's heartbeat timestamp only.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self, worker_id: &str) -> StoreResult<bool> {
        let worker_id = worker_id.to_string();
        self.db
            .execute_retry(move |conn| {
                let now = Utc::now().timestamp();
                let updated = conn.execute(
                    "UPDATE workers SET last_heartbeat = ?1 WHERE worker_id = ?2",
                    rusqlite::params![now, worker_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Workers whose heartbeat is younger than `dead_after`.
    #[instrument(skip(self))]
    pub async fn get_active(&self, dead_after: Duration) -> StoreResult<Vec<Worker>> {
        let cutoff = heartbeat_cutoff(dead_after);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WORKER_COLUMNS} FROM workers WHERE last_heartbeat > ?1 \
                     ORDER BY worker_id"
                ))?;
                collect_workers(&mut stmt, rusqlite::params![cutoff])
            })
            .await
    }

    /// Idle workers with a fresh heartbeat — the router's candidate set.
    #[instrument(skip(self))]
    pub async fn get_idle(&self, dead_after: Duration) -> StoreResult<Vec<Worker>> {
        let cutoff = heartbeat_cutoff(dead_after);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WORKER_COLUMNS} FROM workers \
                     WHERE status = 'idle' AND last_heartbeat > ?1 ORDER BY worker_id"
                ))?;
                collect_workers(&mut stmt, rusqlite::params![cutoff])
            })
            .await
    }

    /// All worker rows, most recently alive first.
    #[instrument(skip(self))]
    pub async fn get_all(&self) -> StoreResult<Vec<Worker>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {WORKER_COLUMNS} FROM workers ORDER BY last_heartbeat DESC"
                ))?;
                collect_workers(&mut stmt, [])
            })
            .await
    }

    /// Mark every worker whose heartbeat is older than `dead_after` as
    /// offline. Returns the number of rows transitioned.
    #[instrument(skip(self))]
    pub async fn mark_stale_offline(&self, dead_after: Duration) -> StoreResult<usize> {
        let cutoff = heartbeat_cutoff(dead_after);
        let marked = self
            .db
            .execute_retry(move |conn| {
                let updated = conn.execute(
                    "UPDATE workers SET status = 'offline' \
                     WHERE last_heartbeat <= ?1 AND status != 'offline'",
                    rusqlite::params![cutoff],
                )?;
                Ok(updated)
            })
            .await?;

        if marked > 0 {
            info!(marked, "stale workers marked offline");
        }
        Ok(marked)
    }

    /// Reap dead workers atomically: every `in_progress` task assigned to
    /// a worker whose heartbeat is older than `dead_after` goes back to
    /// pending with no assignee, then those worker rows are deleted.
    ///
    /// Returns the number of workers removed. Running this twice in a row
    /// yields the same state as running it once.
    #[instrument(skip(self))]
    pub async fn cleanup_dead(&self, dead_after: Duration) -> StoreResult<usize> {
        let cutoff = heartbeat_cutoff(dead_after);
        let reaped = self
            .db
            .execute_retry(move |conn| {
                immediate_tx(conn, |conn| {
                    let now = Utc::now().timestamp();
                    let released = conn.execute(
                        "UPDATE task_master \
                         SET status = 'pending', assigned_to = NULL, updated_at = ?1 \
                         WHERE status = 'in_progress' AND assigned_to IN \
                               (SELECT worker_id FROM workers WHERE last_heartbeat <= ?2)",
                        rusqlite::params![now, cutoff],
                    )?;

                    let deleted = conn.execute(
                        "DELETE FROM workers WHERE last_heartbeat <= ?1",
                        rusqlite::params![cutoff],
                    )?;

                    if deleted > 0 {
                        debug!(deleted, released, "dead workers reaped");
                    }
                    Ok(deleted)
                })
            })
            .await?;

        if reaped > 0 {
            info!(reaped, "cleaned up dead workers");
        }
        Ok(reaped)
    }

    /// Worker counts grouped by status.
    #[instrument(skip(self))]
    pub async fn statistics(&self) -> StoreResult<HashMap<String, i64>> {
        self.db
            .execute(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM workers GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn heartbeat_cutoff(dead_after: Duration) -> i64 {
    Utc::now().timestamp() - dead_after.as_secs() as i64
}

fn collect_workers<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
) -> StoreResult<Vec<Worker>> {
    let rows = stmt
        .query_map(params, map_worker_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|r| r.into_worker()).collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct WorkerRow {
    worker_id: String,
    status: String,
    current_task: Option<String>,
    tasks_completed: i64,
    tasks_failed: i64,
    last_heartbeat: i64,
    created_at: i64,
    location: String,
    performance_factor: f64,
    endpoint_url: Option<String>,
}

fn map_worker_row(row: &Row<'_>) -> rusqlite::Result<WorkerRow> {
    Ok(WorkerRow {
        worker_id: row.get(0)?,
        status: row.get(1)?,
        current_task: row.get(2)?,
        tasks_completed: row.get(3)?,
        tasks_failed: row.get(4)?,
        last_heartbeat: row.get(5)?,
        created_at: row.get(6)?,
        location: row.get(7)?,
        performance_factor: row.get(8)?,
        endpoint_url: row.get(9)?,
    })
}

impl WorkerRow {
    fn into_worker(self) -> StoreResult<Worker> {
        Ok(Worker {
            worker_id: self.worker_id,
            status: WorkerStatus::parse(&self.status)?,
            current_task: self.current_task,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            last_heartbeat: self.last_heartbeat,
            created_at: self.created_at,
            location: WorkerLocation::parse(&self.location)?,
            performance_factor: self.performance_factor,
            endpoint_url: self.endpoint_url,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────
