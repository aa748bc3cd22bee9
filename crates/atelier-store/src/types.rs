//! Row types and status enums shared across the storage engine.
//!
//! The store treats the `content` and `result` columns as opaque JSON
//! blobs; [`TaskContent`] and [`TaskOutcome`] are the typed views used
//! at the boundary by the API surface and the workers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Status enums
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for assignment.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// The column value stored in SQLite.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Liveness state of a worker row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered and waiting for work.
    Idle,
    /// Holds a claimed task.
    Busy,
    /// Executing the model call for its task.
    Processing,
    /// Shut down or missed heartbeats.
    Offline,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "processing" => Ok(WorkerStatus::Processing),
            "offline" => Ok(WorkerStatus::Offline),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

/// Where a worker's compute lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLocation {
    Local,
    Remote,
}

impl WorkerLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerLocation::Local => "local",
            WorkerLocation::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "local" => Ok(WorkerLocation::Local),
            "remote" => Ok(WorkerLocation::Remote),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown worker location: {other}"
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Rows
// ═══════════════════════════════════════════════════════════════════════

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier, assigned at creation.
    pub task_id: String,
    /// Opaque JSON content blob (see [`TaskContent`]).
    pub content: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Scheduling priority in `[1, 10]`, higher first.
    pub priority: i64,
    /// Opaque JSON result blob (see [`TaskOutcome`]), set on terminal
    /// transition.
    pub result: Option<String>,
    /// Who submitted the task.
    pub created_by: Option<String>,
    /// Worker id holding the assignment, if any.
    pub assigned_to: Option<String>,
    /// Unix timestamp when the task was created.
    pub created_at: i64,
    /// Unix timestamp when the task was last updated.
    pub updated_at: i64,
}

impl Task {
    /// Parse the content blob into its typed view.
    pub fn parsed_content(&self) -> StoreResult<TaskContent> {
        Ok(serde_json::from_str(&self.content)?)
    }

    /// Parse the result blob, if present.
    pub fn parsed_result(&self) -> StoreResult<Option<TaskOutcome>> {
        match &self.result {
            Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
            None => Ok(None),
        }
    }

    /// A short human-facing summary used by list endpoints: the first
    /// 100 characters of the prompt plus the parsed task type.
    pub fn summary(&self) -> TaskSummary {
        match self.parsed_content() {
            Ok(content) => TaskSummary {
                summary: truncate_chars(&content.prompt, 100),
                task_type: content.task_type,
            },
            Err(_) => TaskSummary {
                summary: truncate_chars(&self.content, 100),
                task_type: "general".to_string(),
            },
        }
    }
}

/// A registered compute endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    /// Unix timestamp of the last liveness proof.
    pub last_heartbeat: i64,
    pub created_at: i64,
    pub location: WorkerLocation,
    /// Relative throughput weighting used by routing (1.0 = baseline).
    pub performance_factor: f64,
    /// HTTP endpoint for remote workers.
    pub endpoint_url: Option<String>,
}

impl Worker {
    /// Completed / (completed + failed); 0 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// Kind of a pool-manager → worker notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskAssigned,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::TaskAssigned => "task_assigned",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "task_assigned" => Ok(NotificationKind::TaskAssigned),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown notification type: {other}"
            ))),
        }
    }
}

/// A durable message queued through the store for a specific worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub worker_id: String,
    pub kind: NotificationKind,
    pub task_id: Option<String>,
    pub message: Option<String>,
    pub processed: bool,
    pub created_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  Typed blob views
// ═══════════════════════════════════════════════════════════════════════

/// Typed view of a task's `content` blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContent {
    /// Task class, e.g. `general` or `code`.
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    /// The instruction handed to the model.
    pub prompt: String,
    /// Input-file manifest, validated by the worker before execution.
    #[serde(default)]
    pub files: Vec<String>,
    /// Optional output path the executor may write as a side effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    /// Model invocation options.
    #[serde(default)]
    pub options: TaskOptions,
    /// Routing hint: prefer this worker if it is available and idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_worker: Option<String>,
}

fn default_task_type() -> String {
    "general".to_string()
}

/// Model invocation options carried inside the content blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Typed view of a task's `result` blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Prompt summary decoration used by list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub summary: String,
    #[serde(rename = "type")]
    pub task_type: String,
}

// ═══════════════════════════════════════════════════════════════════════
//  ID helpers
// ═══════════════════════════════════════════════════════════════════════

/// Generate a new task id: `task_<yyyymmdd_hhmmss>_<8 hex>`.
pub fn new_task_id() -> String {
    tagged_id("task")
}

/// Generate a new worker id: `worker_<yyyymmdd_hhmmss>_<8 hex>`.
pub fn new_worker_id() -> String {
    tagged_id("worker")
}

fn tagged_id(prefix: &str) -> String {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{ts}_{}", &suffix[..8])
}

/// Truncate to at most `max` characters, appending `...` when shortened.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("bogus").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn content_defaults_apply() {
        let content: TaskContent =
            serde_json::from_str(r#"{"prompt": "write a haiku"}"#).unwrap();
        assert_eq!(content.task_type, "general");
        assert!(content.files.is_empty());
        assert!(content.output_file.is_none());
        assert!(content.preferred_worker.is_none());
    }

    #[test]
    fn success_rate_with_no_history_is_zero() {
        let worker = Worker {
            worker_id: "w".into(),
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            last_heartbeat: 0,
            created_at: 0,
            location: WorkerLocation::Local,
            performance_factor: 1.0,
            endpoint_url: None,
        };
        assert_eq!(worker.success_rate(), 0.0);
    }

    #[test]
    fn generated_ids_are_unique_and_tagged() {
        let a = new_task_id();
        let b = new_task_id();
        assert!(a.starts_with("task_"));
        assert_ne!(a, b);
        assert!(new_worker_id().starts_with("worker_"));
    }

    #[test]
    fn summary_truncates_long_prompts() {
        let long_prompt = "x".repeat(300);
        let task = Task {
            task_id: "t".into(),
            content: serde_json::to_string(&TaskContent {
                task_type: "code".into(),
                prompt: long_prompt,
                files: vec![],
                output_file: None,
                options: TaskOptions::default(),
                preferred_worker: None,
            })
            .unwrap(),
            status: TaskStatus::Pending,
            priority: 5,
            result: None,
            created_by: None,
            assigned_to: None,
            created_at: 0,
            updated_at: 0,
        };
        let summary = task.summary();
        assert_eq!(summary.task_type, "code");
        assert!(summary.summary.ends_with("..."));
        assert_eq!(summary.summary.chars().count(), 103);
    }
}
