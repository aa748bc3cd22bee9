//! # atelier-store
//!
//! Storage engine for Atelier.
//!
//! Provides the single authoritative state of the dispatch platform:
//! a SQLite database in WAL mode holding the task queue, the worker
//! registry, and the durable assignment notifications that connect the
//! pool manager to its workers. All cross-process coordination happens
//! through this crate — a process restart loses nothing essential.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  TaskStore          (queue, claim, complete) │
//! │  WorkerStore        (registry, liveness)     │
//! │  NotificationStore  (assignment messages)    │
//! ├──────────────────────────────────────────────┤
//! │  Database  (rusqlite WAL, bounded pool,      │
//! │             immediate transactions, retry)   │
//! │  Migrations (versioned, transactional)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use atelier_store::{Database, TaskStore, WorkerStore};
//!
//! let db = Database::open_and_migrate("data/atelier.db").await?;
//! let tasks = TaskStore::new(db.clone());
//! let workers = WorkerStore::new(db.clone());
//!
//! let claimed = tasks.acquire_next("worker_1").await?;
//! ```

pub mod db;
pub mod error;
pub mod migration;
pub mod notification_store;
pub mod task_store;
pub mod types;
pub mod worker_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use notification_store::NotificationStore;
pub use task_store::TaskStore;
pub use types::{
    new_task_id, new_worker_id, Notification, NotificationKind, Task, TaskContent, TaskOptions,
    TaskOutcome, TaskStatus, TaskSummary, Worker, WorkerLocation, WorkerStatus,
};
pub use worker_store::{WorkerProfile, WorkerStore};
