//! HTTP surface: decision endpoint and health check.

pub mod decisions;
pub mod health;

use std::sync::Arc;

use axum::{
    Router,
    routing::{any, get},
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{config::ServerConfig, pipeline::DecisionEngine};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
}

impl AppState {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

/// Builds the application router.
pub fn build_app(server: &ServerConfig, state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/decisions", any(decisions::decide))
        .route("/decisions/{*path}", any(decisions::decide))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(server.body_limit_bytes))
        .with_state(state)
}
