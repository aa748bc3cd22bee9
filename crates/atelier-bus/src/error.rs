//! Error types for the atelier-bus crate.

use thiserror::Error;

/// Alias for `Result<T, BusError>`.
pub type BusResult<T> = Result<T, BusError>;

/// Errors that can occur in the message bus.
///
/// Bus failures are advisory by design: the store stays authoritative
/// and callers on the dispatch path log and continue.
#[derive(Debug, Error)]
pub enum BusError {
    /// Redis command or connection failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Spool file I/O failed.
    #[error("spool i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Message payload could not be serialized or parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend is not connected.
    #[error("bus not connected")]
    NotConnected,

    /// No subscription exists for the channel.
    #[error("not subscribed to channel: {0}")]
    NotSubscribed(String),
}
