//! WebSocket Message Types
//!
//! JSON frames exchanged on the command endpoint (`/ws`). Channel-mode
//! connections only ever receive the `error` frame from this set.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::{AdapterError, AdapterResult};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a channel (e.g. "temperature/room1", "alerts/>")
    Subscribe {
        channel: String,
        /// Overrides the token given at connect time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Unsubscribe from a channel
    Unsubscribe { channel: String },
    /// Publish a payload to a channel
    Publish {
        channel: String,
        payload: String,
        #[serde(default)]
        encoding: PayloadEncoding,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Ping for keepalive
    Ping,
}

/// How a payload is carried inside a JSON string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Base64,
}

impl PayloadEncoding {
    /// Decode a payload string into raw bytes
    pub fn decode(self, payload: &str) -> AdapterResult<Vec<u8>> {
        match self {
            PayloadEncoding::Utf8 => Ok(payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => STANDARD
                .decode(payload)
                .map_err(|e| AdapterError::MalformedMessage(format!("invalid base64 payload: {}", e))),
        }
    }

    /// Encode raw bytes, preferring UTF-8 text when possible
    pub fn encode(payload: &[u8]) -> (String, PayloadEncoding) {
        match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (STANDARD.encode(payload), PayloadEncoding::Base64),
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection established
    Connected {
        /// Unique connection identifier
        connection_id: String,
    },
    /// Subscription confirmed
    Subscribed {
        channel: String,
        subscription_id: String,
    },
    /// Unsubscription confirmed
    Unsubscribed {
        channel: String,
        /// False when there was nothing to remove
        removed: bool,
    },
    /// Publish accepted by the broker
    Published { channel: String },
    /// A message delivered on a subscribed channel
    Message {
        channel: String,
        publisher: String,
        content_type: String,
        payload: String,
        encoding: PayloadEncoding,
        /// Unix milliseconds
        created: i64,
    },
    /// Pong response to ping
    Pong,
    /// Error message
    Error {
        /// Machine-readable error code
        code: String,
        /// Error description
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl ServerMessage {
    /// Delivery frame for a broker envelope
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let (payload, encoding) = PayloadEncoding::encode(&envelope.payload);
        ServerMessage::Message {
            channel: envelope.channel.to_string(),
            publisher: envelope.publisher.clone(),
            content_type: envelope.content_type.clone(),
            payload,
            encoding,
            created: envelope.created,
        }
    }

    /// Error frame for an adapter error
    pub fn error(err: &AdapterError, channel: Option<&str>) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            channel: channel.map(str::to_string),
        }
    }

    /// Serialize to a JSON text frame body
    pub fn to_json(&self) -> String {
        // Every variant holds plain strings and integers
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize message");
            String::from(r#"{"type":"error","code":"internal","message":"serialization failed"}"#)
        })
    }
}
