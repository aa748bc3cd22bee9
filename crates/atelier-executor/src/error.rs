//! Error types for the atelier-executor crate.
//!
//! Note that most model failures are *not* errors here: the [`Executor`]
//! contract reports them inside `ExecutionResult` (`success = false`)
//! so workers can finalise the task with the failure recorded verbatim.
//! `ExecutorError` covers plumbing that prevents producing a result at
//! all.
//!
//! [`Executor`]: crate::Executor

use thiserror::Error;

/// Alias for `Result<T, ExecutorError>`.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors that can occur while driving an executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Spawning or waiting on the local subprocess failed.
    #[error("subprocess error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote endpoint could not be reached.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote endpoint answered with something unusable.
    #[error("invalid response from model endpoint: {0}")]
    InvalidResponse(String),

    /// Heartbeat bookkeeping against the store failed.
    #[error("store error: {0}")]
    Store(#[from] atelier_store::StoreError),
}
