use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

use super::routing::RoutingKey;

/// Error decoding a message body.
///
/// Carries the raw bytes for diagnostics (dead-letter inspection); decoding a
/// malformed payload must never take the consumer loop down.
#[derive(Debug, Error)]
#[error("malformed message body: {reason}")]
pub struct DecodeError {
    pub reason: String,
    pub raw: Vec<u8>,
}

/// Canonical wire format for events.
///
/// Serialized as camelCase JSON so cross-service (and cross-language)
/// consumers can decode without shared binary schemas. Unknown fields at the
/// envelope level are ignored on decode; the payload is kept opaque so
/// per-event schemas can evolve without touching the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Hierarchical dotted topic, immutable once published
    pub routing_key: RoutingKey,
    /// Unique id generated at publish time, used for consumer-side dedupe
    pub message_id: Uuid,
    /// Publish-time wall clock (producer side, UTC)
    pub timestamp: DateTime<Utc>,
    /// Whether the broker must survive a restart without losing the message;
    /// always true for business events in this platform
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    /// Event-specific structured data
    pub payload: serde_json::Value,
}

fn default_persistent() -> bool {
    true
}

impl Envelope {
    /// Builds a persistent envelope with a fresh message id and the current
    /// UTC time.
    pub fn new(routing_key: RoutingKey, payload: serde_json::Value) -> Self {
        Self {
            routing_key,
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            persistent: true,
            payload,
        }
    }

    /// Serializes the envelope to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        // Safe to unwrap: the envelope is a plain JSON tree with string keys
        serde_json::to_vec(self).unwrap()
    }

    /// Parses an envelope from its wire form.
    ///
    /// # Errors
    /// Returns a [`DecodeError`] carrying the raw bytes when the body is not
    /// a valid envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|err| DecodeError {
            reason: err.to_string(),
            raw: bytes.to_vec(),
        })
    }

    /// Deserializes the payload into an event type. Unknown payload fields
    /// are ignored for forward compatibility.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.payload.clone()).map_err(|err| DecodeError {
            reason: err.to_string(),
            raw: self.payload.to_string().into_bytes(),
        })
    }
}
