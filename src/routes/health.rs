//! Health check endpoint for Kubernetes probes and monitoring.

use axum::{Json, extract::State};
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// Always "ok" while the process serves requests.
    pub status: &'static str,
    pub version: &'static str,
    /// Number of active rules.
    pub rules: usize,
}

#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        rules: state.engine.rules().len(),
    })
}
