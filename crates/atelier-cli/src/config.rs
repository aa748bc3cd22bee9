//! Configuration file loading.
//!
//! A single `atelier.toml` describes every process role. The raw file
//! uses optional fields with path-dependent defaults (sockets, logs,
//! spool, and output directories all live under `base_dir` unless
//! overridden); [`AtelierConfig::load`] resolves those and hands typed
//! sections to each crate.
//!
//! ```toml
//! base_dir = ".atelier"
//!
//! [pool]
//! min_workers = 1
//! max_workers = 5
//! max_active_tasks = 2
//!
//! [[workers.remote]]
//! worker_id = "lan_box"
//! endpoint_url = "http://10.0.0.7:11434"
//!
//! [executor]
//! kind = "local"
//! command = "/usr/local/bin/model-exec"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use atelier_api::ApiConfig;
use atelier_bus::BusConfig;
use atelier_executor::{LocalExecutorConfig, RemoteExecutorConfig};
use atelier_pool::{PoolConfig, RoutingPolicy, WorkersConfig};
use atelier_worker::SecurityPolicy;

/// Environment override for the database path.
pub const DB_ENV: &str = "ATELIER_DB";

/// Environment override for the control-socket token.
pub const CONTROL_TOKEN_ENV: &str = "ATELIER_CONTROL_TOKEN";

/// The raw `[pool]` section; socket and path fields are optional here
/// and resolved against `base_dir`.
#[derive(Debug, Default, Deserialize)]
struct RawPoolSection {
    min_workers: Option<usize>,
    max_workers: Option<usize>,
    max_active_tasks: Option<usize>,
    tick_secs: Option<u64>,
    dead_after_secs: Option<u64>,
    dispatch_batch: Option<i64>,
    monitor_socket: Option<PathBuf>,
    control_socket: Option<PathBuf>,
    control_token: Option<String>,
    log_dir: Option<PathBuf>,
    worker_binary: Option<PathBuf>,
}

/// The raw `[worker]` section.
#[derive(Debug, Default, Deserialize)]
struct RawWorkerSection {
    poll_interval_secs: Option<u64>,
    heartbeat_every: Option<u32>,
    output_root: Option<PathBuf>,
}

/// The raw `[security]` section.
#[derive(Debug, Default, Deserialize)]
struct RawSecuritySection {
    allowed_roots: Option<Vec<PathBuf>>,
    allowed_extensions: Option<Vec<String>>,
    max_file_size: Option<u64>,
}

/// Which executor a worker process runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorSection {
    Local(LocalExecutorConfig),
    Remote(RemoteExecutorConfig),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_base_dir")]
    base_dir: PathBuf,
    db_path: Option<PathBuf>,
    #[serde(default)]
    pool: RawPoolSection,
    #[serde(default)]
    worker: RawWorkerSection,
    #[serde(default)]
    security: RawSecuritySection,
    #[serde(default)]
    workers: WorkersConfig,
    #[serde(default)]
    routing: RoutingPolicy,
    #[serde(default)]
    api: Option<ApiConfig>,
    bus: Option<BusConfig>,
    executor: Option<ExecutorSection>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".atelier")
}

/// Fully resolved configuration for every process role.
#[derive(Debug)]
pub struct AtelierConfig {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub pool: PoolConfig,
    pub workers: WorkersConfig,
    pub routing: RoutingPolicy,
    pub security: SecurityPolicy,
    pub api: ApiConfig,
    pub bus: BusConfig,
    pub executor: Option<ExecutorSection>,
    /// Worker-loop tuning carried into [`atelier_worker::WorkerConfig`].
    pub worker_poll_interval_secs: u64,
    pub worker_heartbeat_every: u32,
    pub worker_output_root: PathBuf,
}

impl AtelierConfig {
    /// Load and resolve the configuration file. A missing file yields
    /// the defaults (everything under `.atelier/`).
    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawConfig = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            toml::from_str("").expect("empty config parses")
        };

        let base_dir = raw.base_dir;

        let db_path = std::env::var(DB_ENV)
            .map(PathBuf::from)
            .ok()
            .or(raw.db_path)
            .unwrap_or_else(|| base_dir.join("db/atelier.db"));

        let control_token = std::env::var(CONTROL_TOKEN_ENV)
            .ok()
            .or(raw.pool.control_token)
            .unwrap_or_else(|| "default_token".to_string());

        let pool = PoolConfig {
            min_workers: raw.pool.min_workers.unwrap_or(1),
            max_workers: raw.pool.max_workers.unwrap_or(5),
            max_active_tasks: raw.pool.max_active_tasks.unwrap_or(2),
            tick_interval: std::time::Duration::from_secs(raw.pool.tick_secs.unwrap_or(5)),
            dead_after: std::time::Duration::from_secs(raw.pool.dead_after_secs.unwrap_or(60)),
            dispatch_batch: raw.pool.dispatch_batch.unwrap_or(10),
            monitor_socket: raw
                .pool
                .monitor_socket
                .unwrap_or_else(|| base_dir.join("pool_monitor.sock")),
            control_socket: raw
                .pool
                .control_socket
                .unwrap_or_else(|| base_dir.join("pool_control.sock")),
            control_token,
            base_dir: base_dir.clone(),
            log_dir: raw
                .pool
                .log_dir
                .unwrap_or_else(|| base_dir.join("logs/workers")),
            worker_binary: raw.pool.worker_binary,
            worker_args: vec![
                "--config".to_string(),
                path.display().to_string(),
                "worker".to_string(),
            ],
        };

        let output_root = raw
            .worker
            .output_root
            .unwrap_or_else(|| base_dir.join("outputs"));

        let mut security = SecurityPolicy::rooted_at(
            raw.security
                .allowed_roots
                .unwrap_or_else(|| vec![output_root.clone(), base_dir.join("workspaces")]),
        );
        if let Some(extensions) = raw.security.allowed_extensions {
            security.allowed_extensions = extensions;
        }
        if let Some(max_file_size) = raw.security.max_file_size {
            security.max_file_size = max_file_size;
        }

        let bus = raw.bus.unwrap_or_else(|| BusConfig::Spool {
            dir: base_dir.join("spool"),
        });

        Ok(Self {
            db_path,
            pool,
            workers: raw.workers,
            routing: raw.routing,
            security,
            api: raw.api.unwrap_or_default(),
            bus,
            executor: raw.executor,
            worker_poll_interval_secs: raw.worker.poll_interval_secs.unwrap_or(1),
            worker_heartbeat_every: raw.worker.heartbeat_every.unwrap_or(10),
            worker_output_root: output_root,
            base_dir,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AtelierConfig::load(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.base_dir, PathBuf::from(".atelier"));
        assert_eq!(config.pool.min_workers, 1);
        assert_eq!(config.pool.max_workers, 5);
        assert_eq!(config.pool.max_active_tasks, 2);
        assert!(matches!(config.bus, BusConfig::Spool { .. }));
        assert!(config.executor.is_none());
    }

    #[test]
    fn full_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atelier.toml");
        std::fs::write(
            &path,
            r#"
            base_dir = "/srv/atelier"

            [pool]
            min_workers = 2
            max_workers = 8
            max_active_tasks = 4
            control_token = "hunter2"

            [[workers.local]]
            worker_id = "local_1"
            max_tokens = 16384
            capabilities = ["general", "code"]

            [[workers.remote]]
            worker_id = "lan_box"
            endpoint_url = "http://10.0.0.7:11434"
            performance_factor = 0.6

            [routing]
            strategy = "load_balanced"

            [security]
            allowed_roots = ["/srv/atelier/outputs"]
            allowed_extensions = [".py", ".md"]

            [api]
            port = 9000

            [bus]
            backend = "redis"
            url = "redis://127.0.0.1:6379"

            [executor]
            kind = "local"
            command = "/usr/local/bin/model-exec"
            "#,
        )
        .unwrap();

        let config = AtelierConfig::load(&path).unwrap();
        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.pool.control_token, "hunter2");
        assert_eq!(
            config.pool.monitor_socket,
            PathBuf::from("/srv/atelier/pool_monitor.sock")
        );
        assert_eq!(config.workers.local.len(), 1);
        assert_eq!(config.workers.remote[0].worker_id, "lan_box");
        assert_eq!(config.security.allowed_extensions, vec![".py", ".md"]);
        assert_eq!(config.api.port, 9000);
        assert!(matches!(config.bus, BusConfig::Redis { .. }));
        assert!(matches!(config.executor, Some(ExecutorSection::Local(_))));
    }
}
