//! # atelier-pool
//!
//! The dispatch side of Atelier: routing, the scheduling tick, worker
//! process supervision, and the monitor/control sockets.
//!
//! The [`PoolManager`] owns the set of worker processes. Every tick it
//! checks its children, applies the scale plan under the active-task
//! back-pressure cap, pushes pending tasks to idle workers through the
//! [`Router`], and reclaims workers that stopped heartbeating. Nothing
//! here is authoritative — all durable state lives in `atelier-store` —
//! so a pool manager crash leaves in-flight tasks to age back into the
//! queue on its own.

pub mod config;
pub mod control;
pub mod error;
pub mod manager;
pub mod router;

// ── re-exports ───────────────────────────────────────────────────────

pub use config::{
    LocalWorkerSpec, PoolConfig, PriorityRule, RemoteWorkerSpec, RoutingPolicy, RoutingStrategy,
    WorkerClass, WorkersConfig,
};
pub use control::serve_sockets;
pub use error::{PoolError, PoolResult};
pub use manager::{PoolLimits, PoolManager};
pub use router::{score, RouteRequest, Router};
