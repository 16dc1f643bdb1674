//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (broker connected)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;
use crate::broker::BrokerStatus;

/// GET /health/live
///
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Returns 200 while the broker connection is up.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.broker.status() {
        BrokerStatus::Connected => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /health
///
/// Full health status with component details.
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker = state.broker.status();
    let status = match broker {
        BrokerStatus::Connected => "healthy",
        BrokerStatus::Reconnecting => "degraded",
        BrokerStatus::Closed => "unhealthy",
    };

    Json(HealthResponse {
        status: status.to_string(),
        broker,
        connections: state.connection_count().await,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
