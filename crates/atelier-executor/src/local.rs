//! Local subprocess executor.
//!
//! Spawns a configured executable with the prompt as its final argument
//! (context file paths precede it) and captures stdout as the model
//! output. Non-zero exits and timeouts are retried with exponential
//! back-off up to the retry budget. The child runs as its own process
//! group leader and the whole group is killed on timeout, so wrapper
//! scripts cannot leave a forked runtime behind.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExecutorResult;
use crate::{write_output_file, ExecutionRequest, ExecutionResult, Executor, DEFAULT_MAX_RETRIES};

/// Configuration for [`LocalExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalExecutorConfig {
    /// The model runtime executable to spawn.
    pub command: PathBuf,
    /// Fixed arguments placed before the per-request ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the subprocess.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Retry budget for non-zero exits and timeouts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl LocalExecutorConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Executor that shells out to a local model runtime.
pub struct LocalExecutor {
    config: LocalExecutorConfig,
}

impl LocalExecutor {
    pub fn new(config: LocalExecutorConfig) -> Self {
        Self { config }
    }

    /// One spawn-and-wait attempt. Returns `Ok(result)` for both success
    /// and model-reported failure; only spawn plumbing raises an error.
    async fn attempt(&self, request: &ExecutionRequest) -> ExecutorResult<Attempt> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .args(request.context_files.iter())
            .arg(&request.prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group with the child as leader: a timeout kill
        // must reach grandchildren forked by wrapper scripts too.
        #[cfg(unix)]
        command.process_group(0);

        if let Some(workdir) = &self.config.workdir {
            command.current_dir(workdir);
        }
        if let Some(max_tokens) = request.options.max_tokens {
            command.env("ATELIER_MAX_TOKENS", max_tokens.to_string());
        }

        let child = command.spawn()?;
        let pid = child.id();
        debug!(command = %self.config.command.display(), pid, "subprocess spawned");

        let waited = tokio::time::timeout(request.options.timeout, child.wait_with_output()).await;
        match waited {
            Ok(output) => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if output.status.success() {
                    Ok(Attempt::Done(ExecutionResult::ok(stdout)))
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    Ok(Attempt::Retryable(format!(
                        "exit code {}: {stderr}",
                        output.status.code().unwrap_or(-1)
                    )))
                }
            }
            Err(_) => {
                // Dropping the wait future SIGKILLed the direct child
                // (kill_on_drop); the group kill takes out the rest.
                kill_process_group(pid);
                Ok(Attempt::TimedOut)
            }
        }
    }
}

/// Kill every process in the child's group. The child was spawned as
/// group leader, so its pid doubles as the group id.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = std::process::Command::new("kill")
            .args(["-KILL", "--", &format!("-{pid}")])
            .status();
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

enum Attempt {
    Done(ExecutionResult),
    Retryable(String),
    TimedOut,
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutorResult<ExecutionResult> {
        let mut last_error = String::new();
        let mut timed_out = false;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let wait = Duration::from_secs(1 << (attempt - 1));
                info!(attempt, wait_secs = wait.as_secs(), "retrying local execution");
                tokio::time::sleep(wait).await;
            }

            match self.attempt(request).await? {
                Attempt::Done(result) => {
                    if let Some(path) = &request.output_file {
                        write_output_file(path, &result.output)?;
                        debug!(path = %path.display(), "output file written");
                    }
                    return Ok(result);
                }
                Attempt::Retryable(error) => {
                    warn!(attempt, error = %error, "local execution failed");
                    timed_out = false;
                    last_error = error;
                }
                Attempt::TimedOut => {
                    warn!(
                        attempt,
                        timeout_secs = request.options.timeout.as_secs(),
                        "local execution timed out"
                    );
                    timed_out = true;
                }
            }
        }

        if timed_out {
            Ok(ExecutionResult::timeout())
        } else {
            Ok(ExecutionResult::err(last_error))
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionOptions;

    fn quick(config: LocalExecutorConfig) -> LocalExecutor {
        LocalExecutor::new(LocalExecutorConfig {
            max_retries: 0,
            ..config
        })
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let executor = quick(LocalExecutorConfig::new("/bin/echo"));
        let result = executor
            .execute(&ExecutionRequest::new("hello model"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello model");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn context_files_precede_prompt() {
        let executor = quick(LocalExecutorConfig::new("/bin/echo"));
        let mut request = ExecutionRequest::new("the prompt");
        request.context_files = vec!["/tmp/a.py".into(), "/tmp/b.py".into()];

        let result = executor.execute(&request).await.unwrap();
        assert_eq!(result.output, "/tmp/a.py /tmp/b.py the prompt");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure() {
        let executor = quick(LocalExecutorConfig::new("/bin/false"));
        let result = executor
            .execute(&ExecutionRequest::new("ignored"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("exit code"));
    }

    #[tokio::test]
    async fn timeout_yields_canonical_error() {
        let executor = quick(LocalExecutorConfig::new("/bin/sleep"));
        let mut request = ExecutionRequest::new("5");
        request.options = ExecutionOptions {
            timeout: Duration::from_millis(100),
            ..ExecutionOptions::default()
        };

        let result = executor.execute(&request).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn timeout_kills_forked_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");

        // A wrapper-script shape: the shell backgrounds a grandchild
        // that would write a marker file after the timeout fires.
        let executor = quick(LocalExecutorConfig {
            args: vec!["-c".into()],
            ..LocalExecutorConfig::new("/bin/sh")
        });
        let mut request = ExecutionRequest::new(format!(
            "(sleep 1; touch {}) & wait",
            marker.display()
        ));
        request.options = ExecutionOptions {
            timeout: Duration::from_millis(100),
            ..ExecutionOptions::default()
        };

        let result = executor.execute(&request).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("timeout"));

        // Past the grandchild's write time: the group kill got it too.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn output_file_is_written_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/answer.txt");

        let executor = quick(LocalExecutorConfig::new("/bin/echo"));
        let mut request = ExecutionRequest::new("persisted");
        request.output_file = Some(out.clone());

        let result = executor.execute(&request).await.unwrap();
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(out).unwrap(), "persisted");
    }

    #[tokio::test]
    async fn missing_binary_is_an_executor_error() {
        let executor = quick(LocalExecutorConfig::new("/nonexistent/model-runtime"));
        let result = executor.execute(&ExecutionRequest::new("x")).await;
        assert!(result.is_err());
    }
}
