//! API Module
//!
//! HTTP surface of a worker node: build submission, log streaming, kill,
//! plus the separate bootstrap file server backends download from.

pub mod builds;
pub mod error;
pub mod health;
pub mod kill;
pub mod logs;
pub mod stream;

use axum::{
    Router,
    routing::{get, post},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::logmux::LogMux;
use crate::repository::ResultStore;
use crate::scheduler::BuildQueue;
use crate::valet::Valet;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub valet: Arc<Valet>,
    pub mux: Arc<LogMux>,
    pub results: Arc<dyn ResultStore>,
    pub queue: BuildQueue,
    /// How long a kill waits for the build to finish cleanup
    pub kill_wait: Duration,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/builds", post(builds::submit_build).get(builds::list_builds))
        .route("/builds/{id}/summary", get(builds::get_summary))
        .route("/builds/{id}/stages", get(builds::get_stages))
        .route("/builds/{id}/logs", get(logs::stream_logs))
        .route("/builds/{id}/logs/ws", get(logs::stream_logs_ws))
        .route("/builds/{id}/kill", post(kill::kill_build))
        .with_state(state)
        // Log viewers connect from browsers on other origins
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Router serving the bootstrap archive and tool binaries from `dir`
pub fn bootstrap_router(dir: &Path) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir))
        .layer(TraceLayer::new_for_http())
}
