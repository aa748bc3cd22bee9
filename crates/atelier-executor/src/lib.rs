//! # atelier-executor
//!
//! The Executor capability: run a prompt against a model runtime and
//! return its output. The rest of the platform treats this as opaque —
//! a worker hands over `(prompt, context files, options)` and gets back
//! `(success, output, error)`, possibly minutes later.
//!
//! Two implementations:
//!
//! - [`LocalExecutor`] — spawns a configured executable with the prompt
//!   on argv and reads stdout, retrying transient failures.
//! - [`RemoteExecutor`] — issues an HTTP generate request to a
//!   LAN-resident endpoint, refreshing the owning worker's heartbeat in
//!   the store while the call is in flight so long generations do not
//!   trip orphan recovery.

pub mod error;
pub mod local;
pub mod remote;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{ExecutorError, ExecutorResult};
pub use local::{LocalExecutor, LocalExecutorConfig};
pub use remote::{RemoteExecutor, RemoteExecutorConfig};

/// Default wall-clock budget for one execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default retry budget for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One unit of model work.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The instruction handed to the model. Never empty — workers reject
    /// empty prompts before reaching an executor.
    pub prompt: String,
    /// Context files passed through to the runtime.
    pub context_files: Vec<PathBuf>,
    /// When set, the executor writes the output here as a side effect.
    pub output_file: Option<PathBuf>,
    /// Model invocation options.
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context_files: Vec::new(),
            output_file: None,
            options: ExecutionOptions::default(),
        }
    }
}

/// Tunables for a single execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    /// Wall-clock budget; expiry yields `success = false, error = "timeout"`.
    #[serde(default = "default_timeout_field", with = "secs")]
    pub timeout: Duration,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            num_ctx: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn default_timeout_field() -> Duration {
    DEFAULT_TIMEOUT
}

/// Serialize durations as whole seconds in configs and blobs.
mod secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Outcome of one execution attempt chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
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

    /// The canonical timeout result.
    pub fn timeout() -> Self {
        Self::err("timeout")
    }
}

/// Capability contract: run a prompt, return the result.
///
/// A call may block its task for minutes; callers needing liveness run a
/// heartbeat on a separate task (remote executors also refresh it
/// themselves).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutorResult<ExecutionResult>;
}

/// Write the executor output to `path` when the request asked for it,
/// creating parent directories as needed.
pub(crate) fn write_output_file(path: &std::path::Path, output: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, output)
}
