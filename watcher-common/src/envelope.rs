//! Versioned metadata wrapper around every broker payload.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CURRENT_VERSION: &str = "1.0";

/// Enumeration of errors for encoding and decoding envelopes.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(String),
}

/// Envelope wraps a payload with metadata for tracing and versioning.
///
/// Every message produced to a broker topic is wrapped in one. The
/// `message_id` is unique per produce; downstream receivers may use it
/// for idempotence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wrap a payload with a fresh message id and the current timestamp.
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION.to_owned(),
            message_id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Serialize an envelope to JSON bytes.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<Vec<u8>, EnvelopeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Deserialize JSON bytes into an envelope, rejecting unknown major versions.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<Envelope<T>, EnvelopeError> {
    let envelope: Envelope<T> = serde_json::from_slice(data)?;
    check_version(&envelope.version)?;
    Ok(envelope)
}

/// Deserialize an already-parsed JSON value into an envelope.
///
/// Broker deliveries carry the envelope as raw JSON so that a payload the
/// consumer cannot decode stays the consumer's problem, not the broker's.
pub fn decode_value<T: DeserializeOwned>(
    value: serde_json::Value,
) -> Result<Envelope<T>, EnvelopeError> {
    let envelope: Envelope<T> = serde_json::from_value(value)?;
    check_version(&envelope.version)?;
    Ok(envelope)
}

fn check_version(version: &str) -> Result<(), EnvelopeError> {
    let major = version.split('.').next().unwrap_or(version);
    let current_major = CURRENT_VERSION.split('.').next().unwrap_or(CURRENT_VERSION);

    if major != current_major {
        return Err(EnvelopeError::UnsupportedVersion(version.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestPayload {
        name: String,
        value: i64,
    }

    #[test]
    fn test_new_envelope_sets_metadata() {
        let before = Utc::now();
        let envelope = Envelope::new(TestPayload {
            name: "hello".to_owned(),
            value: 42,
        });
        let after = Utc::now();

        assert_eq!(envelope.version, CURRENT_VERSION);
        assert!(!envelope.message_id.is_empty());
        assert!(envelope.timestamp >= before && envelope.timestamp <= after);
        assert_eq!(envelope.payload.name, "hello");
        assert_eq!(envelope.payload.value, 42);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let first = Envelope::new(TestPayload {
            name: String::new(),
            value: 0,
        });
        let second = Envelope::new(TestPayload {
            name: String::new(),
            value: 0,
        });

        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let original = Envelope::new(TestPayload {
            name: "round-trip".to_owned(),
            value: 99,
        });

        let data = encode(&original).expect("failed to encode envelope");
        let decoded: Envelope<TestPayload> = decode(&data).expect("failed to decode envelope");

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_invalid_json() {
        let result = decode::<TestPayload>(b"{invalid}");
        assert!(matches!(result, Err(EnvelopeError::Json(_))));
    }

    #[test]
    fn test_decode_unknown_major_version() {
        let mut envelope = Envelope::new(TestPayload {
            name: "future".to_owned(),
            value: 1,
        });
        envelope.version = "2.0".to_owned();

        let data = encode(&envelope).expect("failed to encode envelope");
        let result = decode::<TestPayload>(&data);

        assert!(matches!(
            result,
            Err(EnvelopeError::UnsupportedVersion(version)) if version == "2.0"
        ));
    }

    #[test]
    fn test_decode_accepts_minor_version_bump() {
        let mut envelope = Envelope::new(TestPayload {
            name: "minor".to_owned(),
            value: 1,
        });
        envelope.version = "1.7".to_owned();

        let data = encode(&envelope).expect("failed to encode envelope");
        assert!(decode::<TestPayload>(&data).is_ok());
    }

    #[test]
    fn test_wire_shape() {
        let envelope = Envelope::new(TestPayload {
            name: "wire".to_owned(),
            value: 3,
        });

        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("version").is_some());
        assert!(value.get("message_id").is_some());
        assert!(value.get("timestamp").is_some());
        assert_eq!(value["payload"]["name"], "wire");
    }
}
