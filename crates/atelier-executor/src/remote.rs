//! Remote HTTP executor.
//!
//! Issues an Ollama-style `/api/generate` request to a LAN-resident model
//! endpoint. While the request is in flight a side task refreshes the
//! owning worker's heartbeat in the store every 10 seconds, so a long
//! generation never looks like a dead worker to orphan recovery.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use atelier_store::WorkerStore;

use crate::error::{ExecutorError, ExecutorResult};
use crate::{write_output_file, ExecutionRequest, ExecutionResult, Executor, DEFAULT_MAX_RETRIES};

/// Heartbeat cadence while a remote call is in flight. Must stay well
/// under the liveness deadline.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Probe timeout for [`RemoteExecutor::health_check`].
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`RemoteExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteExecutorConfig {
    /// Base URL of the endpoint, e.g. `http://10.0.0.7:11434`.
    pub endpoint_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Retry budget for transport failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Executor backed by a remote model endpoint.
pub struct RemoteExecutor {
    config: RemoteExecutorConfig,
    http: reqwest::Client,
    /// When set, heartbeats for this worker are refreshed during calls.
    heartbeat: Option<(WorkerStore, String)>,
}

impl RemoteExecutor {
    pub fn new(config: RemoteExecutorConfig) -> ExecutorResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config,
            http,
            heartbeat: None,
        })
    }

    /// Refresh `worker_id`'s heartbeat in the store while executing.
    pub fn with_heartbeat(mut self, workers: WorkerStore, worker_id: impl Into<String>) -> Self {
        self.heartbeat = Some((workers, worker_id.into()));
        self
    }

    /// Probe the endpoint root. `false` means unreachable or unhealthy.
    pub async fn health_check(&self) -> bool {
        let probe = self
            .http
            .get(&self.config.endpoint_url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(endpoint = %self.config.endpoint_url, %err, "health check failed");
                false
            }
        }
    }

    /// Build the generate-request body for `request`.
    fn request_body(&self, request: &ExecutionRequest) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        if let Some(max_tokens) = request.options.max_tokens {
            options.insert("num_predict".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.options.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(num_ctx) = request.options.num_ctx {
            options.insert("num_ctx".into(), json!(num_ctx));
        }

        // Context files are inlined ahead of the prompt; the remote
        // endpoint has no access to this host's filesystem.
        let mut prompt = String::new();
        for path in &request.context_files {
            if let Ok(contents) = std::fs::read_to_string(path) {
                prompt.push_str(&format!("# File: {}\n{contents}\n\n", path.display()));
            } else {
                warn!(path = %path.display(), "context file unreadable, skipping");
            }
        }
        prompt.push_str(&request.prompt);

        json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": options,
        })
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let (workers, worker_id) = self.heartbeat.clone()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = workers.heartbeat(&worker_id).await {
                    warn!(worker_id = %worker_id, %err, "remote heartbeat refresh failed");
                }
            }
        }))
    }

    async fn attempt(&self, request: &ExecutionRequest) -> ExecutorResult<ExecutionResult> {
        let url = format!(
            "{}/api/generate",
            self.config.endpoint_url.trim_end_matches('/')
        );
        let body = self.request_body(request);

        let sent = self
            .http
            .post(&url)
            .json(&body)
            .timeout(request.options.timeout)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Ok(ExecutionResult::timeout()),
            Err(err) => return Err(ExecutorError::Http(err)),
        };

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExecutorError::InvalidResponse(format!(
                "endpoint returned {status}: {text}"
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExecutorError::InvalidResponse(format!("invalid JSON: {e}")))?;
        let output = value
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ExecutorError::InvalidResponse("missing `response` field".to_string())
            })?;

        Ok(ExecutionResult::ok(output))
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutorResult<ExecutionResult> {
        let heartbeat = self.spawn_heartbeat();

        let mut outcome = Ok(ExecutionResult::err("no attempts made"));
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let wait = Duration::from_secs(1 << (attempt - 1));
                info!(attempt, wait_secs = wait.as_secs(), "retrying remote execution");
                tokio::time::sleep(wait).await;
            }

            outcome = self.attempt(request).await;
            match &outcome {
                Ok(result) => {
                    debug!(success = result.success, "remote execution finished");
                    break;
                }
                Err(err) => {
                    warn!(attempt, %err, endpoint = %self.config.endpoint_url,
                          "remote execution attempt failed");
                }
            }
        }

        if let Some(task) = heartbeat {
            task.abort();
        }

        let result = match outcome {
            Ok(result) => result,
            // Exhausted transport retries: the task fails with the error
            // recorded verbatim rather than poisoning the worker loop.
            Err(err) => ExecutionResult::err(err.to_string()),
        };

        if result.success {
            if let Some(path) = &request.output_file {
                write_output_file(path, &result.output)?;
            }
        }
        Ok(result)
    }
}

// ── tests ────────────────────────────────────────────────────────────
