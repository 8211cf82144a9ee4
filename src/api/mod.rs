//! Public HTTP Facade — a thin adapter mapping HTTP verbs to core
//! operations. No business logic beyond validation and serialization
//! lives here.
//!
//! Follows the sibling `sweetmcp-daemon` package's `axum` + `tower`/
//! `tower-http` usage: a `Router` built from small per-endpoint handler
//! functions, `TraceLayer` for ambient request logging, `CorsLayer`
//! permissive enough for an external dashboard client to poll
//! cross-origin — it's an HTTP client consuming this API, not a
//! collaborator this service controls.

mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::batch::JobEngine;
use crate::config::Tunables;
use crate::dispatch::Dispatcher;
use crate::metrics::AtomicMetrics;
use crate::registry::NodeRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: NodeRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub jobs: Arc<JobEngine>,
    pub tunables: Tunables,
    pub metrics: Arc<AtomicMetrics>,
    pub start_time: Instant,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status/all", get(handlers::status_all))
        .route("/api/v1/alerts", get(handlers::alerts))
        .route("/api/v1/models", get(handlers::models))
        .route("/api/v1/chat/completions", post(handlers::chat_completions))
        .route("/api/v1/dataset/upload", post(handlers::dataset_upload))
        .route(
            "/api/v1/dataset/status/{job_id}",
            get(handlers::dataset_status),
        )
        .route("/api/v1/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
