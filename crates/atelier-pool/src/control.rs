//! Monitor and control sockets.
//!
//! Two local stream sockets expose the pool manager:
//!
//! - the **monitor** socket answers read-only queries and needs no
//!   authentication;
//! - the **control** socket accepts mutating commands and requires the
//!   configured `auth_token` on every request.
//!
//! The protocol is one JSON object per connection: the server reads a
//! single frame (64 KiB cap), writes one JSON reply, and closes.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use atelier_store::TaskStatus;

use crate::error::PoolResult;
use crate::manager::PoolManager;

/// Maximum accepted request frame.
const MAX_FRAME: usize = 64 * 1024;

/// Which command set a socket serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketRole {
    Monitor,
    Control,
}

/// Bind the monitor and control sockets and serve them until aborted.
pub fn serve_sockets(
    manager: Arc<PoolManager>,
    monitor_path: &Path,
    control_path: &Path,
    control_token: &str,
) -> PoolResult<(JoinHandle<()>, JoinHandle<()>)> {
    let monitor = bind(monitor_path)?;
    let control = bind(control_path)?;
    info!(monitor = %monitor_path.display(), control = %control_path.display(),
          "pool sockets listening");

    let monitor_task = tokio::spawn(accept_loop(
        monitor,
        Arc::clone(&manager),
        SocketRole::Monitor,
        String::new(),
    ));
    let control_task = tokio::spawn(accept_loop(
        control,
        manager,
        SocketRole::Control,
        control_token.to_string(),
    ));
    Ok((monitor_task, control_task))
}

fn bind(path: &Path) -> PoolResult<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(path)?)
}

async fn accept_loop(
    listener: UnixListener,
    manager: Arc<PoolManager>,
    role: SocketRole,
    token: String,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let manager = Arc::clone(&manager);
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &manager, role, &token).await {
                        warn!(%err, "socket connection failed");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "socket accept failed");
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    manager: &PoolManager,
    role: SocketRole,
    token: &str,
) -> PoolResult<()> {
    let mut buf = vec![0u8; MAX_FRAME];
    let read = stream.read(&mut buf).await?;

    let response = match serde_json::from_slice::<Value>(&buf[..read]) {
        Ok(request) => {
            debug!(?role, command = request["command"].as_str(), "socket request");
            match role {
                SocketRole::Monitor => handle_monitor(manager, &request).await,
                SocketRole::Control => handle_control(manager, &request, token).await,
            }
        }
        Err(err) => json!({"success": false, "error": format!("invalid request: {err}")}),
    };

    stream
        .write_all(serde_json::to_string(&response)?.as_bytes())
        .await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read-only commands: pool status, worker stats, idle list, health.
pub async fn handle_monitor(manager: &PoolManager, request: &Value) -> Value {
    match request["command"].as_str() {
        Some("get_status") => {
            let limits = manager.limits();
            let active_workers = manager
                .worker_store()
                .get_active(manager.dead_after())
                .await
                .map(|w| w.len())
                .unwrap_or(0);
            let pending = manager
                .task_store()
                .count_by_status(TaskStatus::Pending)
                .await
                .unwrap_or(0);
            json!({
                "success": true,
                "active_workers": active_workers,
                "pending_tasks": pending,
                "workers": manager.managed_worker_ids().await,
                "min_workers": limits.min_workers,
                "max_workers": limits.max_workers,
            })
        }
        Some("get_worker_stats") => match manager.worker_store().get_all().await {
            Ok(workers) => json!({"success": true, "worker_stats": workers}),
            Err(err) => error_response(err),
        },
        Some("get_idle_workers") => {
            match manager.worker_store().get_idle(manager.dead_after()).await {
                Ok(idle) => {
                    let ids: Vec<String> = idle.into_iter().map(|w| w.worker_id).collect();
                    json!({"success": true, "idle_workers": ids})
                }
                Err(err) => error_response(err),
            }
        }
        Some("health_check") => json!({
            "success": true,
            "status": "healthy",
            "running": manager.is_running(),
        }),
        Some(other) => json!({
            "success": false,
            "error": format!("Unknown monitor command: {other}"),
        }),
        None => json!({"success": false, "error": "missing command"}),
    }
}

/// Mutating commands; every request must carry the control token.
pub async fn handle_control(manager: &PoolManager, request: &Value, token: &str) -> Value {
    if request["auth_token"].as_str() != Some(token) {
        return json!({"success": false, "error": "Authentication failed"});
    }

    match request["command"].as_str() {
        Some("spawn_worker") => match manager.spawn_local_worker(None).await {
            Ok(worker_id) => json!({"success": true, "worker_id": worker_id}),
            Err(err) => error_response(err),
        },
        Some("shutdown_worker") => {
            let Some(worker_id) = request["worker_id"].as_str() else {
                return json!({"success": false, "error": "missing worker_id"});
            };
            match manager.shutdown_worker(worker_id).await {
                Ok(()) => json!({
                    "success": true,
                    "message": format!("Worker {worker_id} shutdown initiated"),
                }),
                Err(err) => error_response(err),
            }
        }
        Some("scale") => {
            let limits = manager.limits();
            let min = request["min_workers"]
                .as_u64()
                .map(|v| v as usize)
                .unwrap_or(limits.min_workers);
            let max = request["max_workers"]
                .as_u64()
                .map(|v| v as usize)
                .unwrap_or(limits.max_workers);
            match manager.set_limits(min, max) {
                Ok(()) => json!({
                    "success": true,
                    "message": format!("Scaling parameters updated: min={min}, max={max}"),
                }),
                Err(err) => error_response(err),
            }
        }
        Some("force_scale") => match manager.tick().await {
            Ok(()) => json!({"success": true, "message": "Forced scaling executed"}),
            Err(err) => error_response(err),
        },
        Some("restart_worker") => {
            let Some(worker_id) = request["worker_id"].as_str() else {
                return json!({"success": false, "error": "missing worker_id"});
            };
            match manager.restart_worker(worker_id).await {
                Ok(new_id) => json!({
                    "success": true,
                    "old_worker": worker_id,
                    "new_worker": new_id,
                }),
                Err(err) => error_response(err),
            }
        }
        Some("shutdown_all") => {
            manager.shutdown_all().await;
            json!({"success": true, "message": "All workers shutdown initiated"})
        }
        Some(other) => json!({
            "success": false,
            "error": format!("Unknown control command: {other}"),
        }),
        None => json!({"success": false, "error": "missing command"}),
    }
}

fn error_response(err: impl std::fmt::Display) -> Value {
    json!({"success": false, "error": err.to_string()})
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RoutingPolicy, WorkersConfig};
    use atelier_store::{Database, NotificationStore, TaskContent, TaskStore, WorkerStore};

    async fn manager(dir: &tempfile::TempDir) -> Arc<PoolManager> {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let config = PoolConfig {
            min_workers: 1,
            max_workers: 5,
            max_active_tasks: 2,
            tick_interval: std::time::Duration::from_secs(5),
            dead_after: std::time::Duration::from_secs(60),
            dispatch_batch: 10,
            monitor_socket: dir.path().join("monitor.sock"),
            control_socket: dir.path().join("control.sock"),
            control_token: "secret".into(),
            base_dir: dir.path().to_path_buf(),
            log_dir: dir.path().join("logs"),
            worker_binary: None,
            worker_args: vec![],
        };

        Arc::new(PoolManager::new(
            config,
            WorkersConfig::default(),
            RoutingPolicy::default(),
            TaskStore::new(db.clone()),
            WorkerStore::new(db.clone()),
            NotificationStore::new(db),
            None,
        ))
    }

    fn content(prompt: &str) -> TaskContent {
        TaskContent {
            task_type: "general".into(),
            prompt: prompt.into(),
            files: vec![],
            output_file: None,
            options: Default::default(),
            preferred_worker: None,
        }
    }

    #[tokio::test]
    async fn monitor_status_reports_queue_depth() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        manager
            .task_store()
            .create("t1", &content("x"), 5, "tests")
            .await
            .unwrap();

        let response = handle_monitor(&manager, &json!({"command": "get_status"})).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["pending_tasks"], 1);
        assert_eq!(response["min_workers"], 1);
        assert_eq!(response["max_workers"], 5);
    }

    #[tokio::test]
    async fn monitor_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let response = handle_monitor(&manager, &json!({"command": "health_check"})).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["status"], "healthy");
        assert_eq!(response["running"], false);
    }

    #[tokio::test]
    async fn monitor_rejects_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let response = handle_monitor(&manager, &json!({"command": "drop_tables"})).await;
        assert_eq!(response["success"], false);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("Unknown monitor command"));
    }

    #[tokio::test]
    async fn control_requires_valid_token() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let no_token = handle_control(&manager, &json!({"command": "scale"}), "secret").await;
        assert_eq!(no_token["success"], false);
        assert_eq!(no_token["error"], "Authentication failed");

        let wrong = handle_control(
            &manager,
            &json!({"command": "scale", "auth_token": "guess"}),
            "secret",
        )
        .await;
        assert_eq!(wrong["success"], false);

        // State unchanged after refused commands.
        assert_eq!(manager.limits().max_workers, 5);
    }

    #[tokio::test]
    async fn control_scale_updates_limits() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let response = handle_control(
            &manager,
            &json!({
                "command": "scale",
                "auth_token": "secret",
                "min_workers": 2,
                "max_workers": 8,
            }),
            "secret",
        )
        .await;
        assert_eq!(response["success"], true);
        assert_eq!(manager.limits().min_workers, 2);
        assert_eq!(manager.limits().max_workers, 8);
    }

    #[tokio::test]
    async fn control_scale_rejects_inverted_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let response = handle_control(
            &manager,
            &json!({
                "command": "scale",
                "auth_token": "secret",
                "min_workers": 6,
                "max_workers": 2,
            }),
            "secret",
        )
        .await;
        assert_eq!(response["success"], false);
        assert_eq!(manager.limits().max_workers, 5);
    }

    #[tokio::test]
    async fn control_shutdown_of_untracked_worker_updates_row_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        manager
            .worker_store()
            .register("ghost", &Default::default())
            .await
            .unwrap();

        let response = handle_control(
            &manager,
            &json!({
                "command": "shutdown_worker",
                "auth_token": "secret",
                "worker_id": "ghost",
            }),
            "secret",
        )
        .await;
        assert_eq!(response["success"], true);

        let row = manager
            .worker_store()
            .get("ghost")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, atelier_store::WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn control_restart_unknown_worker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let response = handle_control(
            &manager,
            &json!({
                "command": "restart_worker",
                "auth_token": "secret",
                "worker_id": "nope",
            }),
            "secret",
        )
        .await;
        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn control_rejects_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let response = handle_control(
            &manager,
            &json!({"command": "rm_rf", "auth_token": "secret"}),
            "secret",
        )
        .await;
        assert_eq!(response["success"], false);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("Unknown control command"));
    }

    #[tokio::test]
    async fn sockets_answer_over_unix_stream() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let monitor_path = dir.path().join("monitor.sock");
        let control_path = dir.path().join("control.sock");

        let (monitor_task, control_task) =
            serve_sockets(Arc::clone(&manager), &monitor_path, &control_path, "secret").unwrap();

        // Monitor round-trip.
        let mut stream = UnixStream::connect(&monitor_path).await.unwrap();
        stream
            .write_all(br#"{"command": "health_check"}"#)
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let value: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["success"], true);

        // Control refuses without the token.
        let mut stream = UnixStream::connect(&control_path).await.unwrap();
        stream
            .write_all(br#"{"command": "shutdown_all"}"#)
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let value: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["error"], "Authentication failed");

        monitor_task.abort();
        control_task.abort();
    }
}
