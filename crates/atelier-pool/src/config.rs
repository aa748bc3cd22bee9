//! Pool manager configuration.
//!
//! Deserialized from the `[pool]`, `[workers]`, and `[routing]` sections
//! of the configuration file by the binary and handed in as typed
//! structs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling and supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers kept alive even when the queue is empty.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Hard ceiling on concurrently managed local workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Cluster-wide cap on concurrently in-progress tasks.
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    /// Scheduling tick cadence.
    #[serde(default = "default_tick", with = "serde_secs")]
    pub tick_interval: Duration,
    /// Heartbeat age after which a worker counts as dead.
    #[serde(default = "default_dead_after", with = "serde_secs")]
    pub dead_after: Duration,
    /// How many pending tasks one tick tries to dispatch.
    #[serde(default = "default_dispatch_batch")]
    pub dispatch_batch: i64,
    /// Monitor socket path (read-only commands, unauthenticated).
    pub monitor_socket: PathBuf,
    /// Control socket path (mutating commands, token-authenticated).
    pub control_socket: PathBuf,
    /// Token required on the control socket.
    pub control_token: String,
    /// Base directory used to derive the worker launch token.
    pub base_dir: PathBuf,
    /// Directory for per-worker log files.
    pub log_dir: PathBuf,
    /// Worker executable; defaults to the current binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_binary: Option<PathBuf>,
    /// Leading arguments for the worker executable (e.g. a subcommand).
    #[serde(default)]
    pub worker_args: Vec<String>,
}

fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    5
}
fn default_max_active_tasks() -> usize {
    2
}
fn default_tick() -> Duration {
    Duration::from_secs(5)
}
fn default_dead_after() -> Duration {
    Duration::from_secs(60)
}
fn default_dispatch_batch() -> i64 {
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

/// A locally spawned worker from `[[workers.local]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalWorkerSpec {
    pub worker_id: String,
    #[serde(default = "default_local_performance")]
    pub performance_factor: f64,
    #[serde(default = "default_local_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_local_performance() -> f64 {
    1.0
}
fn default_local_max_tokens() -> u32 {
    32_768
}

/// A LAN-resident worker endpoint from `[[workers.remote]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWorkerSpec {
    pub worker_id: String,
    pub endpoint_url: String,
    #[serde(default = "default_remote_performance")]
    pub performance_factor: f64,
    #[serde(default = "default_remote_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Model name served by the endpoint.
    #[serde(default = "default_remote_model")]
    pub model: String,
}

fn default_remote_performance() -> f64 {
    0.5
}
fn default_remote_max_tokens() -> u32 {
    16_384
}
fn default_remote_model() -> String {
    "gpt-oss:20b".to_string()
}

/// The `[workers]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub local: Vec<LocalWorkerSpec>,
    #[serde(default)]
    pub remote: Vec<RemoteWorkerSpec>,
}

/// Routing strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Score-based selection (the default).
    #[default]
    LoadBalanced,
    /// Score-based selection with the priority rules emphasised.
    PriorityBased,
    /// Rotate through the candidate list.
    RoundRobin,
    /// Prefer local workers while any is idle.
    Geographic,
    /// Restrict candidates to workers advertising the task's type.
    CapabilityBased,
}

/// Worker class named by a priority rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    Local,
    Remote,
}

/// One priority-routing rule: tasks whose priority falls in the range
/// are steered to the preferred worker classes, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRule {
    /// Inclusive `[low, high]` priority range.
    pub priority_range: [i64; 2],
    /// Worker classes to try, in order.
    pub preferred_workers: Vec<WorkerClass>,
    /// Fall back to local workers when no preferred class matches.
    #[serde(default)]
    pub fallback_to_local: bool,
}

impl PriorityRule {
    pub fn matches(&self, priority: i64) -> bool {
        self.priority_range[0] <= priority && priority <= self.priority_range[1]
    }
}

/// The `[routing]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub rules: Vec<PriorityRule>,
}

// ── tests ────────────────────────────────────────────────────────────
