//! API Error Types
//!
//! Errors raised before a WebSocket upgrade completes, converted to HTTP
//! responses with appropriate status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::error::AdapterError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Relay error surfaced during the handshake
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

/// Error details
#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Adapter(e) => {
                let status = match e {
                    AdapterError::Unauthorized(_) => StatusCode::FORBIDDEN,
                    AdapterError::InvalidChannel(_) | AdapterError::MalformedMessage(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    AdapterError::BrokerUnavailable(_) | AdapterError::TooManyConnections(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    AdapterError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    AdapterError::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    AdapterError::ConnectionClosed => StatusCode::GONE,
                };
                (status, e.code())
            }
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, error_code = %code, error_message = %self, "API error occurred");
        } else {
            tracing::debug!(request_id = %request_id, error_code = %code, error_message = %self, "Request rejected");
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
            },
            request_id,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;
