//! REST API route handlers.
//!
//! The synchronous surface clients use to delegate work and read state.
//! Delegation persists the task and lets the pool manager pick it up;
//! in sync mode the handler polls the store for a terminal status and
//! returns the result inline.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use atelier_store::{new_task_id, Task, TaskContent, TaskOptions, TaskOutcome, TaskStatus};

use crate::state::ApiState;

/// Poll cadence while a sync delegation waits for completion.
const SYNC_POLL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// POST /task/delegate
// ---------------------------------------------------------------------------

/// Request body for task delegation.
#[derive(Debug, Deserialize)]
pub struct DelegateBody {
    /// Task class, e.g. `general` or `code`.
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    /// The instruction; `content` is accepted as an alias.
    #[serde(default, alias = "content")]
    pub prompt: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub options: TaskOptions,
    #[serde(default)]
    pub preferred_worker: Option<String>,
}

fn default_task_type() -> String {
    "general".to_string()
}

fn default_priority() -> i64 {
    5
}

/// Create a task and either return immediately (`delegated`) or wait
/// for a terminal status (sync mode).
pub async fn delegate(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<DelegateBody>,
) -> impl IntoResponse {
    let task_id = new_task_id();
    let priority = body.priority.clamp(1, 10);

    if body.prompt.is_empty() && !body.sync {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No prompt provided"})),
        );
    }

    let content = TaskContent {
        task_type: body.task_type.clone(),
        prompt: body.prompt.clone(),
        files: body.files.clone(),
        output_file: body.output_file.clone(),
        options: body.options.clone(),
        preferred_worker: body.preferred_worker.clone(),
    };

    match state
        .tasks
        .create(&task_id, &content, priority, "master_api")
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to create task"})),
            );
        }
        Err(err) => {
            warn!(%err, "task creation failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            );
        }
    }
    info!(task_id = %task_id, priority, sync = body.sync, "task delegated");

    if !body.sync {
        return (
            StatusCode::OK,
            Json(json!({"task_id": task_id, "status": "delegated"})),
        );
    }

    // Sync fast-fail: an empty prompt never reaches an executor. The
    // task is finalised as failed and the result returned inline.
    if body.prompt.is_empty() {
        let outcome = TaskOutcome::err("Prompt is empty");
        if let Err(err) = state
            .tasks
            .update_status(&task_id, TaskStatus::Failed, Some(&outcome))
            .await
        {
            warn!(%err, "failed to finalise empty-prompt task");
        }
        return (
            StatusCode::OK,
            Json(json!({
                "task_id": task_id,
                "status": "completed",
                "result": outcome_json(&outcome),
            })),
        );
    }

    wait_for_completion(&state, &task_id).await
}

/// Poll the store until the task reaches a terminal status or the sync
/// timeout expires. On timeout the client falls back to polling
/// `/task/status/{id}` itself.
async fn wait_for_completion(state: &ApiState, task_id: &str) -> (StatusCode, Json<Value>) {
    let deadline = tokio::time::Instant::now() + state.config.sync_timeout;

    loop {
        match state.tasks.get(task_id).await {
            Ok(Some(task)) if task.status.is_terminal() => {
                let result = task
                    .parsed_result()
                    .ok()
                    .flatten()
                    .map(|o| outcome_json(&o));
                return (
                    StatusCode::OK,
                    Json(json!({
                        "task_id": task_id,
                        "status": "completed",
                        "result": result,
                    })),
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(task_id, %err, "status poll failed");
            }
        }

        if tokio::time::Instant::now() >= deadline {
            info!(task_id, "sync delegation timed out, client should poll");
            return (
                StatusCode::OK,
                Json(json!({"task_id": task_id, "status": "delegated"})),
            );
        }
        tokio::time::sleep(SYNC_POLL).await;
    }
}

// ---------------------------------------------------------------------------
// GET /task/status/{task_id}
// ---------------------------------------------------------------------------

pub async fn task_status(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.get(&task_id).await {
        Ok(Some(task)) => {
            let result = task.parsed_result().ok().flatten();
            (
                StatusCode::OK,
                Json(json!({
                    "task_id": task.task_id,
                    "status": task.status,
                    "result": result.map(|o| outcome_json(&o)),
                    "created_at": task.created_at,
                    "updated_at": task.updated_at,
                })),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Task not found"})),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        ),
    }
}

// ---------------------------------------------------------------------------
// GET /tasks/{pending,active,completed}
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

pub async fn pending_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    list_response(state.tasks.get_pending(query.limit).await)
}

pub async fn active_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    list_response(state.tasks.get_active(query.limit).await)
}

pub async fn completed_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    list_response(state.tasks.get_completed(query.limit).await)
}

fn list_response(tasks: atelier_store::StoreResult<Vec<Task>>) -> (StatusCode, Json<Value>) {
    match tasks {
        Ok(tasks) => {
            let decorated: Vec<Value> = tasks.iter().map(decorate_task).collect();
            (StatusCode::OK, Json(Value::Array(decorated)))
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        ),
    }
}

/// List-endpoint shape: the row plus a prompt summary and parsed type.
fn decorate_task(task: &Task) -> Value {
    let summary = task.summary();
    json!({
        "task_id": task.task_id,
        "status": task.status,
        "priority": task.priority,
        "created_by": task.created_by,
        "assigned_to": task.assigned_to,
        "created_at": task.created_at,
        "updated_at": task.updated_at,
        "summary": summary.summary,
        "type": summary.task_type,
    })
}

// ---------------------------------------------------------------------------
// GET /workers/status
// ---------------------------------------------------------------------------

pub async fn workers_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.workers.get_all().await {
        Ok(workers) => (StatusCode::OK, Json(json!({"workers": workers}))),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        ),
    }
}

// ---------------------------------------------------------------------------
// GET /health, GET /system/info
// ---------------------------------------------------------------------------

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "server": "atelier-master",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn system_info() -> impl IntoResponse {
    Json(json!({
        "server_type": "atelier-master",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn outcome_json(outcome: &TaskOutcome) -> Value {
    json!({
        "success": outcome.success,
        "output": outcome.output,
        "error": outcome.error,
    })
}
