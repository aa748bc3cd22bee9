//! # atelier-api
//!
//! The master HTTP surface of Atelier: clients delegate tasks here and
//! poll their status. Handlers are thin adapters over the store's
//! read and create operations; scheduling happens elsewhere.

pub mod api;
pub mod server;
pub mod state;

// ── re-exports ───────────────────────────────────────────────────────

pub use server::ApiServer;
pub use state::{ApiConfig, ApiState};
