//! The pool manager: owner of the worker-process set and the scheduling
//! tick.
//!
//! Every tick the manager supervises its child processes, applies the
//! scale plan (gated by the active-task back-pressure cap), dispatches
//! pending tasks through the router, and reclaims dead workers. All
//! durable state lives in the store; the process table here is the only
//! in-memory thing the manager owns, and it is rebuilt trivially on
//! restart because orphaned tasks age back to pending via heartbeats.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use atelier_bus::MessageBus;
use atelier_store::{
    new_worker_id, NotificationKind, NotificationStore, Task, TaskStatus, TaskStore,
    WorkerProfile, WorkerStatus, WorkerStore,
};
use atelier_worker::{spawn_token, MAX_TOKENS_ENV, WORKER_ID_ENV, WORKER_TOKEN_ENV};

use crate::config::{LocalWorkerSpec, PoolConfig, RemoteWorkerSpec, RoutingPolicy, WorkersConfig};
use crate::error::{PoolError, PoolResult};
use crate::router::{RouteRequest, Router};

/// Grace period between terminate and kill on worker shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Ticks between periodic stats records (6 × 5 s tick ≈ 30 s).
const STATS_EVERY_TICKS: u64 = 6;

/// Mutable scaling bounds, adjustable at runtime via the control socket.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub min_workers: usize,
    pub max_workers: usize,
}

/// What one scheduling tick decided to do about pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScalePlan {
    /// Back-pressure cap reached or nothing to do.
    Hold,
    /// Spawn this many workers.
    Spawn(usize),
    /// Terminate up to this many idle workers.
    Reap(usize),
}

/// Pure scale decision. Kept free of I/O so the back-pressure contract
/// is directly testable.
pub(crate) fn plan_scale(
    pending: usize,
    active_tasks: usize,
    active_workers: usize,
    limits: PoolLimits,
    max_active_tasks: usize,
) -> ScalePlan {
    // Back-pressure: never scale up past the active-task ceiling.
    if active_tasks >= max_active_tasks {
        return ScalePlan::Hold;
    }

    if pending > 0 && active_workers == 0 {
        return ScalePlan::Spawn(1);
    }

    if pending > 0 && active_workers < limits.max_workers {
        let slack = max_active_tasks - active_tasks;
        let headroom = limits.max_workers - active_workers;
        let wanted = pending.min(slack).min(headroom);
        if wanted > 0 {
            return ScalePlan::Spawn(wanted);
        }
    }

    if pending == 0 && active_workers > limits.min_workers {
        return ScalePlan::Reap(active_workers - limits.min_workers);
    }

    ScalePlan::Hold
}

/// Owner of the worker processes and the scheduling loop.
pub struct PoolManager {
    config: PoolConfig,
    workers_config: WorkersConfig,
    min_workers: AtomicUsize,
    max_workers: AtomicUsize,
    router: Router,
    tasks: TaskStore,
    workers: WorkerStore,
    notifications: NotificationStore,
    bus: Option<Arc<dyn MessageBus>>,
    processes: Mutex<HashMap<String, Child>>,
    running: AtomicBool,
    ticks: AtomicU64,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        workers_config: WorkersConfig,
        routing: RoutingPolicy,
        tasks: TaskStore,
        workers: WorkerStore,
        notifications: NotificationStore,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> Self {
        let mut capabilities = HashMap::new();
        for spec in &workers_config.local {
            capabilities.insert(spec.worker_id.clone(), spec.capabilities.clone());
        }
        for spec in &workers_config.remote {
            capabilities.insert(spec.worker_id.clone(), spec.capabilities.clone());
        }

        Self {
            router: Router::new(routing, capabilities),
            min_workers: AtomicUsize::new(config.min_workers),
            max_workers: AtomicUsize::new(config.max_workers),
            config,
            workers_config,
            tasks,
            workers,
            notifications,
            bus,
            processes: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    // ── accessors used by the control surface ─────────────────────────

    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            min_workers: self.min_workers.load(Ordering::Acquire),
            max_workers: self.max_workers.load(Ordering::Acquire),
        }
    }

    pub fn set_limits(&self, min_workers: usize, max_workers: usize) -> PoolResult<()> {
        if max_workers < min_workers {
            return Err(PoolError::Config(format!(
                "max_workers {max_workers} below min_workers {min_workers}"
            )));
        }
        self.min_workers.store(min_workers, Ordering::Release);
        self.max_workers.store(max_workers, Ordering::Release);
        info!(min_workers, max_workers, "scaling limits updated");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ids of the worker processes this manager currently owns.
    pub async fn managed_worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn task_store(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn worker_store(&self) -> &WorkerStore {
        &self.workers
    }

    pub fn dead_after(&self) -> Duration {
        self.config.dead_after
    }

    // ── lifecycle ─────────────────────────────────────────────────────

    /// Spawn the configured initial workers and register remote ones.
    pub async fn initialize_workers(&self) -> PoolResult<()> {
        let initial = self.limits().min_workers;
        if initial == 0 {
            info!("starting with 0 workers, will spawn on demand");
        }

        for index in 0..initial {
            let spec = self.workers_config.local.get(index).cloned();
            self.spawn_local_worker(spec.as_ref()).await?;
        }

        for spec in self.workers_config.remote.clone() {
            self.register_remote_worker(&spec).await?;
        }
        Ok(())
    }

    /// Spawn one local worker process and register it in the store.
    ///
    /// Without a spec, a fresh worker id is generated and defaults apply.
    pub async fn spawn_local_worker(&self, spec: Option<&LocalWorkerSpec>) -> PoolResult<String> {
        let worker_id = spec
            .map(|s| s.worker_id.clone())
            .unwrap_or_else(new_worker_id);
        let max_tokens = spec.map(|s| s.max_tokens).unwrap_or(32_768);
        let performance_factor = spec.map(|s| s.performance_factor).unwrap_or(1.0);

        let binary = match &self.config.worker_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };

        std::fs::create_dir_all(&self.config.log_dir)?;
        let log_path = self.config.log_dir.join(format!("{worker_id}.log"));
        let log_file = std::fs::File::create(&log_path)?;
        let log_err = log_file.try_clone()?;

        info!(worker_id = %worker_id, binary = %binary.display(), "spawning worker");
        let child = Command::new(&binary)
            .args(&self.config.worker_args)
            .arg("--worker-id")
            .arg(&worker_id)
            .env(WORKER_ID_ENV, &worker_id)
            .env(WORKER_TOKEN_ENV, spawn_token(&self.config.base_dir))
            .env(MAX_TOKENS_ENV, max_tokens.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        self.processes.lock().await.insert(worker_id.clone(), child);

        let profile = WorkerProfile {
            performance_factor,
            ..WorkerProfile::default()
        };
        self.workers.register(&worker_id, &profile).await?;
        Ok(worker_id)
    }

    /// Register a remote worker endpoint in the store.
    async fn register_remote_worker(&self, spec: &RemoteWorkerSpec) -> PoolResult<()> {
        self.workers
            .register(
                &spec.worker_id,
                &WorkerProfile::remote(&spec.endpoint_url, spec.performance_factor),
            )
            .await?;
        info!(worker_id = %spec.worker_id, endpoint = %spec.endpoint_url,
              "remote worker registered");
        Ok(())
    }

    /// Terminate a worker: graceful signal, a grace period, then kill.
    ///
    /// The store row is marked offline even when no process is tracked —
    /// a command addressed to an already-dead worker still succeeds, and
    /// any stale process is left to exit on its own.
    pub async fn shutdown_worker(&self, worker_id: &str) -> PoolResult<()> {
        let child = self.processes.lock().await.remove(worker_id);
        if let Some(mut child) = child {
            info!(worker_id, "shutting down worker");
            terminate(&mut child).await;
        } else {
            debug!(worker_id, "no tracked process, updating store row only");
        }

        self.workers
            .update_status(worker_id, WorkerStatus::Offline, None)
            .await?;
        Ok(())
    }

    /// Terminate every managed worker process.
    pub async fn shutdown_all(&self) {
        let ids = self.managed_worker_ids().await;
        for worker_id in ids {
            if let Err(err) = self.shutdown_worker(&worker_id).await {
                warn!(worker_id = %worker_id, %err, "failed to shut down worker");
            }
        }
    }

    /// Replace a managed worker with a freshly spawned one.
    pub async fn restart_worker(&self, worker_id: &str) -> PoolResult<String> {
        if !self.processes.lock().await.contains_key(worker_id) {
            return Err(PoolError::WorkerNotFound(worker_id.to_string()));
        }
        self.shutdown_worker(worker_id).await?;
        self.spawn_local_worker(None).await
    }

    /// Run the scheduling loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PoolResult<()> {
        self.running.store(true, Ordering::Release);
        info!(
            min_workers = self.limits().min_workers,
            max_workers = self.limits().max_workers,
            max_active_tasks = self.config.max_active_tasks,
            "pool manager started"
        );

        self.initialize_workers().await?;

        while !*shutdown.borrow() {
            if let Err(err) = self.tick().await {
                error!(%err, "scheduling tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.running.store(false, Ordering::Release);
        self.shutdown_all().await;
        info!("pool manager stopped");
        Ok(())
    }

    /// One scheduling tick: supervise, scale, dispatch, health, stats.
    pub async fn tick(&self) -> PoolResult<()> {
        self.supervise_processes().await;

        let pending = self.tasks.count_by_status(TaskStatus::Pending).await? as usize;
        let active_tasks = self.tasks.count_by_status(TaskStatus::InProgress).await? as usize;
        let active_workers = self.workers.get_active(self.config.dead_after).await?.len();

        debug!(pending, active_tasks, active_workers, "tick state");

        match plan_scale(
            pending,
            active_tasks,
            active_workers,
            self.limits(),
            self.config.max_active_tasks,
        ) {
            ScalePlan::Hold => {}
            ScalePlan::Spawn(count) => {
                info!(count, pending, "scaling up");
                for _ in 0..count {
                    if let Err(err) = self.spawn_local_worker(None).await {
                        warn!(%err, "worker spawn failed");
                        break;
                    }
                }
            }
            ScalePlan::Reap(count) => {
                self.scale_down(count).await;
            }
        }

        self.dispatch_pending().await?;

        // Health pass: stale workers go offline, then the same deadline
        // governs reaping their rows and releasing their orphaned tasks
        // back to pending — an offline worker never holds an assignment
        // past this tick.
        self.workers.mark_stale_offline(self.config.dead_after).await?;
        self.workers.cleanup_dead(self.config.dead_after).await?;

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        if tick % STATS_EVERY_TICKS == 0 {
            self.emit_stats().await;
        }
        Ok(())
    }

    /// Detect child processes that exited on their own and mark their
    /// rows offline. No immediate respawn — the next tick scales back up
    /// if load demands it.
    async fn supervise_processes(&self) {
        let mut exited = Vec::new();
        {
            let mut processes = self.processes.lock().await;
            processes.retain(|worker_id, child| match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(worker_id = %worker_id, %status, "worker process exited unexpectedly");
                    exited.push(worker_id.clone());
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    warn!(worker_id = %worker_id, %err, "failed to poll worker process");
                    true
                }
            });
        }

        for worker_id in exited {
            if let Err(err) = self
                .workers
                .update_status(&worker_id, WorkerStatus::Offline, None)
                .await
            {
                warn!(worker_id = %worker_id, %err, "failed to mark crashed worker offline");
            }
        }
    }

    /// Terminate up to `count` idle managed workers.
    async fn scale_down(&self, count: usize) {
        let idle = match self.workers.get_idle(self.config.dead_after).await {
            Ok(idle) => idle,
            Err(err) => {
                warn!(%err, "failed to list idle workers for scale-down");
                return;
            }
        };

        let managed = self.managed_worker_ids().await;
        let victims: Vec<String> = idle
            .into_iter()
            .map(|w| w.worker_id)
            .filter(|id| managed.contains(id))
            .take(count)
            .collect();

        if victims.is_empty() {
            return;
        }
        info!(count = victims.len(), "scaling down idle workers");
        for worker_id in victims {
            if let Err(err) = self.shutdown_worker(&worker_id).await {
                warn!(worker_id = %worker_id, %err, "scale-down shutdown failed");
            }
        }
    }

    /// Route the top pending tasks to idle workers.
    ///
    /// Each chosen worker is removed from the candidate set for the rest
    /// of the tick, so one tick never assigns two tasks to one worker.
    async fn dispatch_pending(&self) -> PoolResult<()> {
        let pending = self.tasks.get_pending(self.config.dispatch_batch).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut idle = self.workers.get_idle(self.config.dead_after).await?;
        for task in pending {
            if idle.is_empty() {
                break;
            }

            let request = route_request(&task);
            let Some(worker_id) = self.router.route(&request, &idle) else {
                break;
            };

            // Conditional transition: loses cleanly against a concurrent
            // direct claim of the same task.
            if !self.tasks.assign_to_worker(&task.task_id, &worker_id).await? {
                debug!(task_id = %task.task_id, "task no longer pending, skipping");
                continue;
            }
            self.workers
                .update_status(&worker_id, WorkerStatus::Busy, Some(&task.task_id))
                .await?;
            self.notifications
                .enqueue(
                    &worker_id,
                    NotificationKind::TaskAssigned,
                    Some(&task.task_id),
                    Some(&format!(
                        "Task {} assigned - process immediately",
                        task.task_id
                    )),
                )
                .await?;

            info!(task_id = %task.task_id, worker_id = %worker_id, "task dispatched");
            self.publish(
                "task_events",
                json!({
                    "event": "task_assigned",
                    "task_id": task.task_id,
                    "worker_id": worker_id,
                    "priority": task.priority,
                }),
            )
            .await;

            idle.retain(|w| w.worker_id != worker_id);
        }
        Ok(())
    }

    /// Periodic stats record: logged and mirrored onto the bus.
    async fn emit_stats(&self) {
        let tasks = self.tasks.statistics().await.unwrap_or_default();
        let workers = self.workers.statistics().await.unwrap_or_default();
        info!(?tasks, ?workers, "pool statistics");

        self.publish(
            "pool_stats",
            json!({
                "event": "pool_stats",
                "tasks_by_status": tasks,
                "workers_by_status": workers,
            }),
        )
        .await;
    }

    /// Best-effort bus publish; the bus is observational only.
    async fn publish(&self, channel: &str, message: serde_json::Value) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(channel, &message).await {
                warn!(channel, %err, "bus publish failed");
            }
        }
    }
}

/// Routing metadata extracted from a task row.
fn route_request(task: &Task) -> RouteRequest {
    let (task_type, preferred_worker) = match task.parsed_content() {
        Ok(content) => (content.task_type, content.preferred_worker),
        Err(_) => ("general".to_string(), None),
    };
    RouteRequest {
        task_id: task.task_id.clone(),
        task_type,
        priority: task.priority,
        preferred_worker,
    }
}

/// Graceful terminate: SIGTERM, wait out the grace period, then kill.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%status, "worker exited after terminate");
        }
        Ok(Err(err)) => {
            warn!(%err, "wait on terminating worker failed");
        }
        Err(_) => {
            warn!("worker ignored terminate, killing");
            if let Err(err) = child.kill().await {
                warn!(%err, "kill failed");
            }
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PoolLimits = PoolLimits {
        min_workers: 1,
        max_workers: 5,
    };

    #[test]
    fn backpressure_blocks_scale_up() {
        // Active tasks at the cap: nothing is spawned no matter the queue.
        assert_eq!(plan_scale(10, 2, 1, LIMITS, 2), ScalePlan::Hold);
        assert_eq!(plan_scale(10, 3, 1, LIMITS, 2), ScalePlan::Hold);
    }

    #[test]
    fn pending_work_with_no_workers_spawns_one_immediately() {
        assert_eq!(plan_scale(7, 0, 0, LIMITS, 2), ScalePlan::Spawn(1));
    }

    #[test]
    fn spawn_count_is_min_of_pending_slack_headroom() {
        // pending=10, slack=2-0=2, headroom=5-1=4 → 2.
        assert_eq!(plan_scale(10, 0, 1, LIMITS, 2), ScalePlan::Spawn(2));
        // pending=1 dominates.
        assert_eq!(plan_scale(1, 0, 1, LIMITS, 2), ScalePlan::Spawn(1));
        // headroom dominates with a generous cap.
        assert_eq!(plan_scale(10, 0, 4, LIMITS, 20), ScalePlan::Spawn(1));
    }

    #[test]
    fn max_workers_bounds_spawning() {
        assert_eq!(plan_scale(10, 0, 5, LIMITS, 20), ScalePlan::Hold);
    }

    #[test]
    fn idle_pool_scales_down_to_min() {
        assert_eq!(plan_scale(0, 0, 4, LIMITS, 2), ScalePlan::Reap(3));
        assert_eq!(plan_scale(0, 0, 1, LIMITS, 2), ScalePlan::Hold);
    }

    #[test]
    fn busy_pool_with_empty_queue_holds() {
        // One task still running, queue empty, one worker: nothing to do.
        assert_eq!(plan_scale(0, 1, 1, LIMITS, 2), ScalePlan::Hold);
    }
}
