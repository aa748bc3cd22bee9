//! CLI entry point for Atelier.
//!
//! Provides the `atelier` command with subcommands for the three
//! process roles plus a quick status readout:
//!
//! - `atelier pool` — pool manager: spawns workers, runs the scheduler
//! - `atelier worker` — one worker process (normally exec'd by the pool)
//! - `atelier serve` — master HTTP API
//! - `atelier status` — print task and worker statistics

mod cli;
mod config;
mod helpers;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use atelier_api::ApiServer;
use atelier_executor::{Executor, LocalExecutor, RemoteExecutor};
use atelier_pool::{serve_sockets, PoolManager};
use atelier_store::{
    Database, NotificationStore, TaskStore, WorkerProfile, WorkerStore,
};
use atelier_worker::{spawn_token, spawn_token_matches, Worker, WorkerConfig, WORKER_ID_ENV};

use crate::cli::{Cli, Commands};
use crate::config::{AtelierConfig, ExecutorSection};
use crate::helpers::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing).
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AtelierConfig::load(&cli.config)?;

    match cli.command {
        Commands::Pool => cmd_pool(config).await,
        Commands::Worker { worker_id } => cmd_worker(config, worker_id).await,
        Commands::Serve => cmd_serve(config).await,
        Commands::Status => cmd_status(config).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: pool
// ---------------------------------------------------------------------------

async fn cmd_pool(config: AtelierConfig) -> Result<()> {
    init_tracing("info");

    let db = open_database(&config).await?;
    let bus = atelier_bus::connect(&config.bus)
        .await
        .context("failed to connect message bus")?;

    let manager = Arc::new(PoolManager::new(
        config.pool.clone(),
        config.workers.clone(),
        config.routing.clone(),
        TaskStore::new(db.clone()),
        WorkerStore::new(db.clone()),
        NotificationStore::new(db),
        Some(bus),
    ));

    let (monitor_task, control_task) = serve_sockets(
        Arc::clone(&manager),
        &config.pool.monitor_socket,
        &config.pool.control_socket,
        &config.pool.control_token,
    )?;

    let shutdown = shutdown_signal();
    manager.run(shutdown).await?;

    monitor_task.abort();
    control_task.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: worker
// ---------------------------------------------------------------------------

async fn cmd_worker(config: AtelierConfig, worker_id: Option<String>) -> Result<()> {
    init_tracing("info");

    // Workers only run under the pool manager; refuse anything else.
    let expected = spawn_token(&config.base_dir);
    if !spawn_token_matches(&expected) {
        eprintln!("error: workers must be started by the pool manager");
        std::process::exit(1);
    }

    let worker_id = worker_id
        .or_else(|| std::env::var(WORKER_ID_ENV).ok())
        .context("no worker id given (flag or environment)")?;

    let db = open_database(&config).await?;
    let tasks = TaskStore::new(db.clone());
    let workers = WorkerStore::new(db.clone());
    let notifications = NotificationStore::new(db);

    // Remote workers proxy to their endpoint; everything else runs the
    // configured local executor.
    let remote_spec = config
        .workers
        .remote
        .iter()
        .find(|spec| spec.worker_id == worker_id)
        .cloned();

    let (executor, profile): (Arc<dyn Executor>, WorkerProfile) = match (
        remote_spec,
        config.executor.clone(),
    ) {
        (Some(spec), executor) => {
            let remote_config = match executor {
                Some(ExecutorSection::Remote(remote)) => remote,
                _ => atelier_executor::RemoteExecutorConfig {
                    endpoint_url: spec.endpoint_url.clone(),
                    model: spec.model.clone(),
                    max_retries: atelier_executor::DEFAULT_MAX_RETRIES,
                },
            };
            let executor = RemoteExecutor::new(remote_config)
                .context("failed to build remote executor")?
                .with_heartbeat(workers.clone(), worker_id.clone());
            let profile = WorkerProfile::remote(&spec.endpoint_url, spec.performance_factor);
            (Arc::new(executor), profile)
        }
        (None, Some(ExecutorSection::Local(local))) => {
            (Arc::new(LocalExecutor::new(local)), WorkerProfile::default())
        }
        (None, Some(ExecutorSection::Remote(remote))) => {
            let executor = RemoteExecutor::new(remote)
                .context("failed to build remote executor")?
                .with_heartbeat(workers.clone(), worker_id.clone());
            (Arc::new(executor), WorkerProfile::default())
        }
        (None, None) => anyhow::bail!("no [executor] configured for local worker {worker_id}"),
    };

    let worker_config = WorkerConfig {
        worker_id: worker_id.clone(),
        poll_interval: std::time::Duration::from_secs(config.worker_poll_interval_secs),
        heartbeat_every: config.worker_heartbeat_every,
        security: config.security.clone(),
        output_root: config.worker_output_root.clone(),
    };

    info!(worker_id = %worker_id, "starting worker process");
    let worker = Worker::new(
        worker_config,
        profile,
        tasks,
        workers,
        notifications,
        executor,
    );

    let shutdown = shutdown_signal();
    worker.run(shutdown).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config: AtelierConfig) -> Result<()> {
    init_tracing("info");

    let db = open_database(&config).await?;
    let server = ApiServer::new(config.api.clone(), db);

    info!(addr = %server.addr(), "starting master api");
    server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("api server failed: {e}"))
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config: AtelierConfig) -> Result<()> {
    init_tracing("warn");

    let db = open_database(&config).await?;
    let tasks = TaskStore::new(db.clone());
    let workers = WorkerStore::new(db);

    let task_stats = tasks.statistics().await?;
    let worker_stats = workers.statistics().await?;

    println!("Tasks:");
    if task_stats.is_empty() {
        println!("  (none)");
    }
    for (status, count) in sorted(task_stats) {
        println!("  {status:<12} {count}");
    }

    println!("Workers:");
    if worker_stats.is_empty() {
        println!("  (none)");
    }
    for (status, count) in sorted(worker_stats) {
        println!("  {status:<12} {count}");
    }

    for worker in workers.get_all().await? {
        let total = worker.tasks_completed + worker.tasks_failed;
        let rate = if total > 0 {
            format!("{:.1}%", 100.0 * worker.success_rate())
        } else {
            "n/a".to_string()
        };
        println!(
            "  {} [{}] completed={} failed={} success={}",
            worker.worker_id,
            worker.status.as_str(),
            worker.tasks_completed,
            worker.tasks_failed,
            rate,
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

async fn open_database(config: &AtelierConfig) -> Result<Database> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = Database::open_and_migrate(config.db_path.clone())
        .await
        .context("failed to open database")?;
    info!(path = %config.db_path.display(), "store initialized");
    Ok(db)
}

fn sorted(map: std::collections::HashMap<String, i64>) -> Vec<(String, i64)> {
    let mut entries: Vec<_> = map.into_iter().collect();
    entries.sort();
    entries
}
