//! Data Transfer Objects
//!
//! Response bodies of the HTTP routes.

use serde::{Deserialize, Serialize};

use crate::broker::BrokerStatus;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub broker: BrokerStatus,
    pub connections: usize,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Query parameters accepted on the WebSocket handshake
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    /// Token, when not sent in the `Authorization` header
    pub authorization: Option<String>,
    /// Content type of published payloads (channel endpoint only)
    pub content_type: Option<String>,
}
