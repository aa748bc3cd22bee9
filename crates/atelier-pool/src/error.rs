//! Error types for the atelier-pool crate.

use thiserror::Error;

/// Alias for `Result<T, PoolError>`.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur in the pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] atelier_store::StoreError),

    /// Spawning or signalling a worker process failed.
    #[error("process error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket protocol payload was malformed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A control command named a worker this manager does not own.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),
}
