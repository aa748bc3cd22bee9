//! Master API server setup and startup.
//!
//! [`ApiServer`] composes the axum router, registers all routes, and
//! starts the HTTP listener.

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use atelier_store::{Database, TaskStore, WorkerStore};

use crate::api;
use crate::state::{ApiConfig, ApiState};

/// The Atelier master API server.
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    /// Create a new server over the shared database handle.
    pub fn new(config: ApiConfig, db: Database) -> Self {
        let state = Arc::new(ApiState {
            tasks: TaskStore::new(db.clone()),
            workers: WorkerStore::new(db),
            config: config.clone(),
        });
        Self { config, state }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Build the axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin("*".parse::<HeaderValue>().expect("static header"))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any);

        Router::new()
            .route("/task/delegate", post(api::delegate))
            .route("/task/status/{task_id}", get(api::task_status))
            .route("/tasks/pending", get(api::pending_tasks))
            .route("/tasks/active", get(api::active_tasks))
            .route("/tasks/completed", get(api::completed_tasks))
            .route("/workers/status", get(api::workers_status))
            .route("/health", get(api::health))
            .route("/system/info", get(api::system_info))
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Start the server and block until it is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.addr();
        let router = self.router();

        tracing::info!(addr = %addr, "starting master api");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
