//! Task routing.
//!
//! [`Router::route`] is a pure selection over a task's metadata and a
//! snapshot of available workers — it never mutates task or worker
//! state, so it is safe to call from any context. For fixed inputs the
//! same worker comes back every time; ties keep the earlier list
//! element.
//!
//! Selection order:
//!
//! 1. The task's preferred worker, when present and idle.
//! 2. When every local worker is busy but remotes exist, the
//!    best-scoring remote (local-busy fast path).
//! 3. The first matching priority rule restricts candidates to its
//!    worker classes, with an optional local fallback.
//! 4. The highest [`score`] among the remaining candidates.
//! 5. Failing all of that, the first available worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use atelier_store::{Worker, WorkerLocation, WorkerStatus};

use crate::config::{RoutingPolicy, RoutingStrategy, WorkerClass};

/// The task metadata routing looks at.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub task_id: String,
    pub task_type: String,
    pub priority: i64,
    pub preferred_worker: Option<String>,
}

/// Routing figure-of-merit: throughput weighting, load state, and track
/// record.
pub fn score(worker: &Worker) -> f64 {
    let mut score = 100.0 * worker.performance_factor;
    match worker.status {
        WorkerStatus::Idle => score += 50.0,
        WorkerStatus::Busy => score -= 30.0,
        _ => {}
    }
    score += 30.0 * worker.success_rate();
    score
}

/// Chooses a worker for each dispatchable task.
pub struct Router {
    policy: RoutingPolicy,
    /// Worker capabilities from configuration, keyed by worker id.
    capabilities: HashMap<String, Vec<String>>,
    /// Cursor for the round-robin strategy. Routing state only — task
    /// and worker rows are never touched.
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(policy: RoutingPolicy, capabilities: HashMap<String, Vec<String>>) -> Self {
        info!(strategy = ?policy.strategy, rules = policy.rules.len(), "router initialised");
        Self {
            policy,
            capabilities,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick a worker for `task` among `available`, or `None` only when
    /// the list is empty.
    pub fn route(&self, task: &RouteRequest, available: &[Worker]) -> Option<String> {
        if available.is_empty() {
            return None;
        }

        // Preferred worker wins when it is actually ready.
        if let Some(preferred) = &task.preferred_worker {
            let ready = available
                .iter()
                .find(|w| &w.worker_id == preferred && w.status == WorkerStatus::Idle);
            if let Some(worker) = ready {
                info!(task_id = %task.task_id, worker_id = %worker.worker_id,
                      "routed to preferred worker");
                return Some(worker.worker_id.clone());
            }
            debug!(task_id = %task.task_id, preferred = %preferred,
                   "preferred worker unavailable, falling back");
        }

        let chosen = match self.policy.strategy {
            RoutingStrategy::LoadBalanced | RoutingStrategy::PriorityBased => {
                self.route_scored(task, available)
            }
            RoutingStrategy::RoundRobin => self.route_round_robin(available),
            RoutingStrategy::Geographic => self.route_geographic(task, available),
            RoutingStrategy::CapabilityBased => self.route_by_capability(task, available),
        };

        let chosen = chosen.or_else(|| available.first().map(|w| w.worker_id.clone()));
        if let Some(worker_id) = &chosen {
            info!(task_id = %task.task_id, worker_id = %worker_id,
                  priority = task.priority, "task routed");
        }
        chosen
    }

    /// The default scoring pipeline: local-busy fast path, then priority
    /// rules, then best score overall.
    fn route_scored(&self, task: &RouteRequest, available: &[Worker]) -> Option<String> {
        if let Some(remote) = self.local_busy_fast_path(task, available) {
            return Some(remote);
        }

        if let Some(rule) = self.policy.rules.iter().find(|r| r.matches(task.priority)) {
            for class in &rule.preferred_workers {
                let candidates: Vec<&Worker> = available
                    .iter()
                    .filter(|w| matches_class(w, *class))
                    .collect();
                if let Some(best) = best_of(&candidates) {
                    return Some(best);
                }
            }
            if rule.fallback_to_local {
                let locals: Vec<&Worker> = available
                    .iter()
                    .filter(|w| w.location == WorkerLocation::Local)
                    .collect();
                if let Some(best) = best_of(&locals) {
                    return Some(best);
                }
            }
        }

        best_of(&available.iter().collect::<Vec<_>>())
    }

    /// When no local worker is idle but remotes exist, delegate
    /// immediately to the best remote.
    fn local_busy_fast_path(&self, task: &RouteRequest, available: &[Worker]) -> Option<String> {
        let any_local_idle = available
            .iter()
            .any(|w| w.location == WorkerLocation::Local && w.status == WorkerStatus::Idle);
        if any_local_idle {
            return None;
        }

        let remotes: Vec<&Worker> = available
            .iter()
            .filter(|w| w.location == WorkerLocation::Remote)
            .collect();
        let best = best_of(&remotes)?;
        info!(task_id = %task.task_id, worker_id = %best,
              "local workers busy, delegating to remote");
        Some(best)
    }

    fn route_round_robin(&self, available: &[Worker]) -> Option<String> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        available.get(index).map(|w| w.worker_id.clone())
    }

    fn route_geographic(&self, task: &RouteRequest, available: &[Worker]) -> Option<String> {
        let locals: Vec<&Worker> = available
            .iter()
            .filter(|w| w.location == WorkerLocation::Local && w.status == WorkerStatus::Idle)
            .collect();
        if let Some(best) = best_of(&locals) {
            return Some(best);
        }
        self.route_scored(task, available)
    }

    fn route_by_capability(&self, task: &RouteRequest, available: &[Worker]) -> Option<String> {
        let capable: Vec<&Worker> = available
            .iter()
            .filter(|w| {
                self.capabilities
                    .get(&w.worker_id)
                    .is_some_and(|caps| caps.iter().any(|c| c == &task.task_type))
            })
            .collect();
        if let Some(best) = best_of(&capable) {
            return Some(best);
        }
        self.route_scored(task, available)
    }
}

/// Highest score wins; the first candidate keeps ties.
fn best_of(candidates: &[&Worker]) -> Option<String> {
    candidates
        .iter()
        .fold(None::<(&Worker, f64)>, |best, worker| {
            let s = score(worker);
            match best {
                Some((_, best_score)) if best_score >= s => best,
                _ => Some((worker, s)),
            }
        })
        .map(|(worker, _)| worker.worker_id.clone())
}

fn matches_class(worker: &Worker, class: WorkerClass) -> bool {
    match class {
        WorkerClass::Local => worker.location == WorkerLocation::Local,
        WorkerClass::Remote => worker.location == WorkerLocation::Remote,
    }
}

// ── tests ────────────────────────────────────────────────────────────
