//! # atelier-worker
//!
//! The worker process: a single long-lived loop that owns exactly one
//! [`Executor`] and drains task assignments pushed to it through the
//! store's notification queue.
//!
//! Lifecycle on start:
//!
//! 1. Verify the launch token injected by the pool manager (done by the
//!    binary via [`spawn_token_matches`] before constructing a worker).
//! 2. Register in the store, overwriting any stale row.
//! 3. Enter the main loop; a shutdown signal marks the row offline.
//!
//! The loop claims notifications, fetches the named task (which must be
//! in progress and assigned to this worker), validates it, executes it,
//! and **always** finalises through `complete_with_stats` — the store
//! enforces that only the assigned worker may complete. While the
//! executor runs, a side task refreshes the heartbeat every 5 s so a
//! minutes-long model call never trips orphan recovery.

pub mod deliverable;
pub mod error;
pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use atelier_executor::{ExecutionOptions, ExecutionRequest, Executor};
use atelier_store::{
    NotificationKind, NotificationStore, Task, TaskOutcome, TaskStore, WorkerProfile, WorkerStatus,
    WorkerStore,
};

pub use deliverable::{DeliverableExtractor, DeliverableReport};
pub use error::{WorkerError, WorkerResult};
pub use validate::{SecurityPolicy, ValidationError};

/// Environment variable carrying the worker id assigned by the spawner.
pub const WORKER_ID_ENV: &str = "ATELIER_WORKER_ID";

/// Environment variable carrying the launch authentication token.
pub const WORKER_TOKEN_ENV: &str = "ATELIER_WORKER_TOKEN";

/// Environment variable carrying the per-worker token budget.
pub const MAX_TOKENS_ENV: &str = "ATELIER_MAX_TOKENS";

/// Heartbeat cadence while the executor is running.
const EXECUTION_HEARTBEAT: Duration = Duration::from_secs(5);

/// The launch token expected for workers spawned under `base_dir`.
pub fn spawn_token(base_dir: &Path) -> String {
    format!("{}_POOL_MANAGER", base_dir.display())
}

/// Whether this process carries the launch token the pool manager
/// injects. Workers started any other way must exit non-zero.
pub fn spawn_token_matches(expected: &str) -> bool {
    std::env::var(WORKER_TOKEN_ENV).is_ok_and(|token| token == expected)
}

/// Worker process settings, from the `[worker]` config section plus the
/// spawn environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// This worker's id.
    pub worker_id: String,
    /// Idle-loop sleep between notification polls.
    #[serde(default = "default_poll_interval", with = "serde_secs")]
    pub poll_interval: Duration,
    /// Refresh the heartbeat every this many idle iterations.
    #[serde(default = "default_heartbeat_every")]
    pub heartbeat_every: u32,
    /// File-operation allow-lists.
    pub security: SecurityPolicy,
    /// Root directory for extracted deliverables.
    pub output_root: PathBuf,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_every() -> u32 {
    10
}

mod serde_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// A single worker process bound to one executor.
pub struct Worker {
    config: WorkerConfig,
    profile: WorkerProfile,
    tasks: TaskStore,
    workers: WorkerStore,
    notifications: NotificationStore,
    executor: Arc<dyn Executor>,
    extractor: DeliverableExtractor,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        profile: WorkerProfile,
        tasks: TaskStore,
        workers: WorkerStore,
        notifications: NotificationStore,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let extractor = DeliverableExtractor::new(&config.output_root);
        Self {
            config,
            profile,
            tasks,
            workers,
            notifications,
            executor,
            extractor,
        }
    }

    /// Register, then run the main loop until `shutdown` flips to true.
    /// On exit the worker row is marked offline.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let worker_id = self.config.worker_id.clone();
        self.workers.register(&worker_id, &self.profile).await?;
        info!(worker_id = %worker_id, "worker started");

        let mut idle_iterations: u32 = 0;
        while !*shutdown.borrow() {
            let claimed = match self.notifications.claim(&worker_id).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    warn!(%err, "failed to poll notifications");
                    Vec::new()
                }
            };

            let mut worked = false;
            for notification in claimed {
                if notification.kind != NotificationKind::TaskAssigned {
                    continue;
                }
                let Some(task_id) = notification.task_id else {
                    warn!("task_assigned notification without a task id");
                    continue;
                };
                self.handle_assignment(&task_id).await;
                worked = true;
            }

            if worked {
                idle_iterations = 0;
                continue;
            }

            // Idle: sleep, but wake immediately on shutdown.
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => break,
            }

            idle_iterations += 1;
            if idle_iterations >= self.config.heartbeat_every {
                idle_iterations = 0;
                if let Err(err) = self
                    .workers
                    .update_status(&worker_id, WorkerStatus::Idle, None)
                    .await
                {
                    warn!(%err, "idle heartbeat failed");
                }
            }
        }

        if let Err(err) = self
            .workers
            .update_status(&worker_id, WorkerStatus::Offline, None)
            .await
        {
            warn!(%err, "failed to mark worker offline on shutdown");
        }
        info!(worker_id = %worker_id, "worker stopped");
        Ok(())
    }

    /// Fetch and execute a task named by an assignment notification.
    async fn handle_assignment(&self, task_id: &str) {
        let worker_id = &self.config.worker_id;
        let task = match self.tasks.get_assigned(task_id, worker_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                // Assignment was reclaimed (orphan recovery) or never
                // belonged to us; nothing to release.
                warn!(task_id, "assigned task not retrievable, skipping");
                return;
            }
            Err(err) => {
                error!(task_id, %err, "failed to fetch assigned task");
                return;
            }
        };

        info!(task_id, "processing assigned task");
        let outcome = self.process(&task).await;

        match self
            .tasks
            .complete_with_stats(task_id, worker_id, &outcome)
            .await
        {
            Ok(true) => {
                info!(task_id, success = outcome.success, "task completed");
            }
            Ok(false) => {
                warn!(task_id, "completion rejected; assignment no longer ours");
            }
            Err(err) => {
                error!(task_id, %err, "failed to record completion");
            }
        }

        // Deliverables are best-effort and never affect the task result.
        let prompt = task
            .parsed_content()
            .map(|c| c.prompt)
            .unwrap_or_default();
        match self
            .extractor
            .extract(task_id, &prompt, &outcome, task.priority)
        {
            Ok(Some(report)) => {
                debug!(task_id, dir = %report.task_dir.display(), "deliverable extracted");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(task_id, %err, "deliverable extraction failed");
            }
        }
    }

    /// Validate and execute one task, producing the outcome to persist.
    /// Never returns an error: every failure becomes a failed outcome so
    /// the assignment is always released.
    async fn process(&self, task: &Task) -> TaskOutcome {
        let worker_id = &self.config.worker_id;

        let content = match task.parsed_content() {
            Ok(content) => content,
            Err(err) => {
                warn!(task_id = %task.task_id, %err, "unparsable task content");
                return TaskOutcome::err("Invalid JSON format in task content");
            }
        };

        if content.prompt.is_empty() {
            return TaskOutcome::err("Prompt is empty");
        }

        for file in &content.files {
            if let Err(err) = self.config.security.validate(Path::new(file)) {
                warn!(task_id = %task.task_id, file, %err, "input file rejected");
                return TaskOutcome::err(format!("Security validation failed: {err}"));
            }
        }
        if let Some(output_file) = &content.output_file {
            if let Err(err) = self.config.security.validate(Path::new(output_file)) {
                warn!(task_id = %task.task_id, output_file, %err, "output file rejected");
                return TaskOutcome::err(format!("Security validation failed: {err}"));
            }
        }

        if let Err(err) = self
            .workers
            .update_status(worker_id, WorkerStatus::Processing, Some(&task.task_id))
            .await
        {
            warn!(%err, "failed to enter processing state");
        }

        let request = ExecutionRequest {
            prompt: content.prompt.clone(),
            context_files: content.files.iter().map(PathBuf::from).collect(),
            output_file: content.output_file.as_ref().map(PathBuf::from),
            options: ExecutionOptions {
                max_tokens: content.options.max_tokens,
                temperature: content.options.temperature,
                num_ctx: content.options.num_ctx,
                timeout: content
                    .options
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(atelier_executor::DEFAULT_TIMEOUT),
            },
        };

        // Liveness while the model call blocks, possibly for minutes.
        let heartbeat = {
            let workers = self.workers.clone();
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(EXECUTION_HEARTBEAT);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = workers.heartbeat(&worker_id).await {
                        warn!(%err, "execution heartbeat failed");
                    }
                }
            })
        };

        let executed = self.executor.execute(&request).await;
        heartbeat.abort();

        match executed {
            Ok(result) => TaskOutcome {
                success: result.success,
                output: result.output,
                error: result.error,
            },
            Err(err) => {
                error!(task_id = %task.task_id, %err, "executor failed");
                TaskOutcome::err(err.to_string())
            }
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atelier_executor::{ExecutionResult, ExecutorResult};
    use atelier_store::{Database, TaskContent};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Executor double that records invocations and echoes the prompt.
    struct EchoExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(&self, request: &ExecutionRequest) -> ExecutorResult<ExecutionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult::ok(format!("echo: {}", request.prompt)))
        }
    }

    struct Harness {
        worker: Worker,
        tasks: TaskStore,
        workers: WorkerStore,
        notifications: NotificationStore,
        executor: Arc<EchoExecutor>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        // On-disk database: the run-loop test reads concurrently with
        // the worker task, which in-memory shared-cache mode dislikes.
        let db = Database::open(dir.path().join("test.db")).unwrap();
        db.run_migrations().await.unwrap();

        let tasks = TaskStore::new(db.clone());
        let workers = WorkerStore::new(db.clone());
        let notifications = NotificationStore::new(db);

        let executor = Arc::new(EchoExecutor {
            calls: AtomicU32::new(0),
        });
        let config = WorkerConfig {
            worker_id: "w1".into(),
            poll_interval: Duration::from_millis(10),
            heartbeat_every: 10,
            security: SecurityPolicy::rooted_at(vec![dir.path().to_path_buf()]),
            output_root: dir.path().join("outputs"),
        };

        let worker = Worker::new(
            config,
            WorkerProfile::default(),
            tasks.clone(),
            workers.clone(),
            notifications.clone(),
            executor.clone(),
        );

        Harness {
            worker,
            tasks,
            workers,
            notifications,
            executor,
            _dir: dir,
        }
    }

    async fn submit_and_assign(h: &Harness, task_id: &str, content: &TaskContent) {
        h.workers
            .register("w1", &WorkerProfile::default())
            .await
            .unwrap();
        h.tasks.create(task_id, content, 5, "tests").await.unwrap();
        assert!(h.tasks.assign_to_worker(task_id, "w1").await.unwrap());
        h.notifications
            .enqueue("w1", NotificationKind::TaskAssigned, Some(task_id), None)
            .await
            .unwrap();
    }

    fn plain_content(prompt: &str) -> TaskContent {
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
    async fn assignment_executes_and_completes() {
        let h = harness().await;
        submit_and_assign(&h, "t1", &plain_content("do the thing")).await;

        h.worker.handle_assignment("t1").await;

        let task = h.tasks.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, atelier_store::TaskStatus::Completed);
        let outcome = task.parsed_result().unwrap().unwrap();
        assert_eq!(outcome.output, "echo: do the thing");

        let worker = h.workers.get("w1").await.unwrap().unwrap();
        assert_eq!(worker.tasks_completed, 1);
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_prompt_fails_without_execution() {
        let h = harness().await;
        submit_and_assign(&h, "t1", &plain_content("")).await;

        h.worker.handle_assignment("t1").await;

        let task = h.tasks.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, atelier_store::TaskStatus::Failed);
        let outcome = task.parsed_result().unwrap().unwrap();
        assert_eq!(outcome.error.as_deref(), Some("Prompt is empty"));

        // The executor was never invoked.
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);

        let worker = h.workers.get("w1").await.unwrap().unwrap();
        assert_eq!(worker.tasks_failed, 1);
    }

    #[tokio::test]
    async fn disallowed_file_fails_validation() {
        let h = harness().await;
        let mut content = plain_content("read this");
        content.files = vec!["/etc/passwd.txt".into()];
        submit_and_assign(&h, "t1", &content).await;

        h.worker.handle_assignment("t1").await;

        let task = h.tasks.get("t1").await.unwrap().unwrap();
        let outcome = task.parsed_result().unwrap().unwrap();
        assert!(!outcome.success);
        assert!(outcome
            .error
            .unwrap()
            .starts_with("Security validation failed"));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unassigned_task_is_skipped() {
        let h = harness().await;
        h.workers
            .register("w1", &WorkerProfile::default())
            .await
            .unwrap();
        h.tasks
            .create("t1", &plain_content("x"), 5, "tests")
            .await
            .unwrap();
        // Never assigned: the worker must not touch it.
        h.worker.handle_assignment("t1").await;

        let task = h.tasks.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, atelier_store::TaskStatus::Pending);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_loop_drains_assignment_and_stops() {
        let h = harness().await;
        submit_and_assign(&h, "t1", &plain_content("loop work")).await;

        let (tx, rx) = watch::channel(false);
        let worker = h.worker;
        let tasks = h.tasks.clone();
        let run = tokio::spawn(async move { worker.run(rx).await });

        // Wait for the loop to pick up the notification and finish.
        for _ in 0..100 {
            let task = tasks.get("t1").await.unwrap().unwrap();
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        run.await.unwrap().unwrap();

        let task = h.tasks.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, atelier_store::TaskStatus::Completed);

        // Shutdown marked the worker offline.
        let worker_row = h.workers.get("w1").await.unwrap().unwrap();
        assert_eq!(worker_row.status, WorkerStatus::Offline);
    }

    #[test]
    fn spawn_token_is_deterministic() {
        let token = spawn_token(Path::new("/srv/atelier"));
        assert_eq!(token, "/srv/atelier_POOL_MANAGER");
    }
}
