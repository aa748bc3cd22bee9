//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema — task queue and worker registry",
        sql: r#"
            CREATE TABLE task_master (
                task_id     TEXT PRIMARY KEY,
                content     TEXT,
                status      TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','in_progress','completed','failed','cancelled')),
                priority    INTEGER NOT NULL DEFAULT 5,
                result      TEXT,
                created_by  TEXT,
                assigned_to TEXT,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE INDEX idx_task_master_status ON task_master(status);
            CREATE INDEX idx_task_master_priority ON task_master(priority DESC);

            CREATE TABLE workers (
                worker_id          TEXT PRIMARY KEY,
                status             TEXT NOT NULL DEFAULT 'idle' CHECK(status IN ('idle','busy','processing','offline')),
                current_task       TEXT,
                tasks_completed    INTEGER NOT NULL DEFAULT 0,
                tasks_failed       INTEGER NOT NULL DEFAULT 0,
                last_heartbeat     INTEGER NOT NULL,
                created_at         INTEGER NOT NULL,
                location           TEXT NOT NULL DEFAULT 'local' CHECK(location IN ('local','remote')),
                performance_factor REAL NOT NULL DEFAULT 1.0,
                endpoint_url       TEXT
            );
            CREATE INDEX idx_workers_status ON workers(status);
        "#,
    },
    Migration {
        version: 2,
        description: "worker notifications — durable assignment messages",
        sql: r#"
            CREATE TABLE worker_notifications (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                worker_id         TEXT NOT NULL,
                notification_type TEXT NOT NULL,
                task_id           TEXT,
                message           TEXT,
                processed         INTEGER NOT NULL DEFAULT 0,
                created_at        INTEGER NOT NULL
            );
            CREATE INDEX idx_worker_notifications_target
                ON worker_notifications(worker_id, processed);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function — call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        new_version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "all migrations applied"
    );
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the `_migrations` bookkeeping table if it does not exist.
fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// The expected latest migration version (update when adding migrations).
    const LATEST_VERSION: u32 = 2;

    fn setup_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        assert!(tables.contains(&"task_master".to_string()));
        assert!(tables.contains(&"workers".to_string()));
        assert!(tables.contains(&"worker_notifications".to_string()));
    }

    #[test]
    fn status_check_constraints_hold() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        conn.execute(
            "INSERT INTO task_master (task_id, content, status, priority, created_at, updated_at) \
             VALUES ('t1', '{}', 'pending', 5, 0, 0)",
            [],
        )
        .unwrap();

        let bad_status = conn.execute(
            "INSERT INTO task_master (task_id, content, status, priority, created_at, updated_at) \
             VALUES ('t2', '{}', 'running', 5, 0, 0)",
            [],
        );
        assert!(bad_status.is_err());

        let bad_location = conn.execute(
            "INSERT INTO workers (worker_id, status, last_heartbeat, created_at, location) \
             VALUES ('w1', 'idle', 0, 0, 'cloud')",
            [],
        );
        assert!(bad_location.is_err());
    }
}
