//! Adapter error types
//!
//! Defines the errors surfaced by the relay engine to clients and callers.

use thiserror::Error;

/// Errors that can occur while relaying messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Token invalid, revoked, or without access to the channel
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed channel identifier
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Broker could not be reached
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Payload exceeds the configured limit
    #[error("Payload too large: {size} bytes (limit: {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Content type not in the allow-list
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Client frame or broker message could not be understood
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Connection is closing or unknown to the registry
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection limit reached
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),
}

impl AdapterError {
    /// Stable machine-readable code sent to clients in error frames
    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::Unauthorized(_) => "unauthorized",
            AdapterError::InvalidChannel(_) => "invalid_channel",
            AdapterError::BrokerUnavailable(_) => "broker_unavailable",
            AdapterError::PayloadTooLarge { .. } => "payload_too_large",
            AdapterError::UnsupportedContentType(_) => "unsupported_content_type",
            AdapterError::MalformedMessage(_) => "malformed_message",
            AdapterError::ConnectionClosed => "connection_closed",
            AdapterError::TooManyConnections(_) => "too_many_connections",
        }
    }

    /// Whether a bounded retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::BrokerUnavailable(_))
    }
}

impl From<bincode::Error> for AdapterError {
    fn from(err: bincode::Error) -> Self {
        AdapterError::MalformedMessage(err.to_string())
    }
}

/// Result type alias for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;
