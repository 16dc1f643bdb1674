//! Message Envelope Codec
//!
//! The envelope is the normalized message format exchanged with the broker
//! and shared with the other protocol adapters. Payloads are validated
//! against the configured limits before anything reaches the broker.

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::{AdapterError, AdapterResult};

/// Protocol tag stamped on messages published by this adapter
pub const PROTOCOL: &str = "websocket";

/// Content type assumed when the client does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/senml+json";

/// Normalized broker message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination channel (with optional sub-topic)
    pub channel: Channel,
    /// Identity of the publishing thing, assigned by the adapter
    pub publisher: String,
    /// Originating protocol adapter
    pub protocol: String,
    /// Media type of the payload
    pub content_type: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Creation time in Unix milliseconds
    pub created: i64,
}

impl Envelope {
    /// Create an envelope stamped with the current time and this adapter's protocol tag
    pub fn new(
        channel: Channel,
        publisher: impl Into<String>,
        content_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            channel,
            publisher: publisher.into(),
            protocol: PROTOCOL.to_string(),
            content_type: content_type.into(),
            payload,
            created: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Limits applied by the codec
#[derive(Debug, Clone)]
pub struct CodecLimits {
    /// Maximum payload size in bytes
    pub max_payload_bytes: usize,
    /// Accepted media types; empty accepts everything
    pub content_types: Vec<String>,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024, // 256 KB
            content_types: vec![
                "application/senml+json".to_string(),
                "application/senml+cbor".to_string(),
                "application/json".to_string(),
                "text/plain".to_string(),
                "application/octet-stream".to_string(),
            ],
        }
    }
}

/// Validates payloads and converts envelopes to and from broker bytes
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    limits: CodecLimits,
}

impl EnvelopeCodec {
    /// Create a codec with the given limits
    pub fn new(limits: CodecLimits) -> Self {
        Self { limits }
    }

    /// Get the configured limits
    pub fn limits(&self) -> &CodecLimits {
        &self.limits
    }

    /// Check payload size and content type
    pub fn validate(&self, payload: &[u8], content_type: &str) -> AdapterResult<()> {
        if payload.len() > self.limits.max_payload_bytes {
            return Err(AdapterError::PayloadTooLarge {
                size: payload.len(),
                limit: self.limits.max_payload_bytes,
            });
        }

        if !self.is_supported(content_type) {
            return Err(AdapterError::UnsupportedContentType(
                content_type.to_string(),
            ));
        }

        Ok(())
    }

    /// Serialize an envelope for the broker
    pub fn encode(&self, envelope: &Envelope) -> AdapterResult<Vec<u8>> {
        self.validate(&envelope.payload, &envelope.content_type)?;
        Ok(bincode::serialize(envelope)?)
    }

    /// Deserialize an envelope received from the broker
    pub fn decode(&self, bytes: &[u8]) -> AdapterResult<Envelope> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        self.validate(&envelope.payload, &envelope.content_type)?;
        Ok(envelope)
    }

    fn is_supported(&self, content_type: &str) -> bool {
        if self.limits.content_types.is_empty() {
            return true;
        }
        let essence = media_type(content_type);
        if essence.is_empty() {
            return false;
        }
        self.limits
            .content_types
            .iter()
            .any(|allowed| media_type(allowed) == essence)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(CodecLimits::default())
    }
}

/// Media type without parameters, lowercased
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_codec() -> EnvelopeCodec {
        EnvelopeCodec::new(CodecLimits {
            max_payload_bytes: 1024,
            ..CodecLimits::default()
        })
    }

    fn envelope(payload: Vec<u8>) -> Envelope {
        Envelope::new(
            Channel::parse("temperature/room1").unwrap(),
            "thing-1",
            "application/json",
            payload,
        )
    }

    #[test]
    fn test_round_trip_across_payload_sizes() {
        let codec = small_codec();

        for size in [0, 1, 17, 512, 1023, 1024] {
            let original = envelope(vec![0xAB; size]);
            let bytes = codec.encode(&original).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            assert_eq!(decoded.channel, original.channel);
            assert_eq!(decoded.payload, original.payload);
            assert_eq!(decoded.content_type, original.content_type);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let codec = small_codec();
        let err = codec.encode(&envelope(vec![0; 1025])).unwrap_err();
        assert_eq!(
            err,
            AdapterError::PayloadTooLarge {
                size: 1025,
                limit: 1024
            }
        );
    }

    #[test]
    fn test_content_type_matching() {
        let codec = small_codec();
        assert!(codec.validate(b"x", "application/json").is_ok());
        assert!(codec
            .validate(b"x", "Application/JSON; charset=utf-8")
            .is_ok());
        assert!(matches!(
            codec.validate(b"x", "image/png"),
            Err(AdapterError::UnsupportedContentType(_))
        ));
        assert!(codec.validate(b"x", "").is_err());
    }

    #[test]
    fn test_empty_allow_list_accepts_any() {
        let codec = EnvelopeCodec::new(CodecLimits {
            max_payload_bytes: 16,
            content_types: Vec::new(),
        });
        assert!(codec.validate(b"x", "image/png").is_ok());
    }

    #[test]
    fn test_decode_garbage() {
        let codec = small_codec();
        assert!(matches!(
            codec.decode(&[1, 2, 3]),
            Err(AdapterError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_new_stamps_protocol() {
        let env = envelope(b"22.5".to_vec());
        assert_eq!(env.protocol, PROTOCOL);
        assert!(env.created > 0);
    }
}
