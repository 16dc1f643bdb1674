//! Metrics Route
//!
//! - GET /metrics - Prometheus text exposition

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::AppState;

/// GET /metrics
pub async fn prometheus(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => ApiError::NotFound("metrics recorder not installed".to_string()).into_response(),
    }
}
