//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Distributed LLM task dispatch.
#[derive(Debug, Parser)]
#[command(name = "atelier", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "atelier.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pool manager (spawns and supervises workers).
    Pool,
    /// Run a single worker process. Normally exec'd by the pool manager.
    Worker {
        /// Worker id; falls back to the spawn environment.
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Run the master HTTP API.
    Serve,
    /// Print task and worker statistics.
    Status,
}
