//! Error types for the atelier-worker crate.

use thiserror::Error;

/// Alias for `Result<T, WorkerError>`.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur in a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] atelier_store::StoreError),

    /// Executor plumbing failed.
    #[error("executor error: {0}")]
    Executor(#[from] atelier_executor::ExecutorError),

    /// Deliverable file I/O failed.
    #[error("deliverable i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
