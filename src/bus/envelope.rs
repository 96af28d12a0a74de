//! The unit of communication on the bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelopes must name a topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Envelope topic must not be empty")]
pub struct EmptyTopic;

/// Topic plus payload plus optional metadata.
///
/// Envelopes are immutable: builders consume and return a new value, and
/// the payload is shared behind an `Arc` so dispatching one envelope to
/// many subscribers never copies it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    topic: String,
    payload: Arc<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

/// Unchecked wire shape, validated into an `Envelope`.
#[derive(Deserialize)]
struct WireEnvelope {
    topic: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EmptyTopic;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let envelope = Envelope::new(wire.topic, wire.payload)?;
        Ok(Envelope {
            id: wire.id,
            timestamp: wire.timestamp,
            ..envelope
        })
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Envelope::try_from(wire).map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    /// Create an envelope without id or timestamp.
    pub fn new(topic: impl Into<String>, payload: Value) -> Result<Self, EmptyTopic> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(EmptyTopic);
        }
        Ok(Self {
            topic,
            payload: Arc::new(payload),
            id: None,
            timestamp: None,
        })
    }

    pub fn with_id(self, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_timestamp(self, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    /// Fill in a random id and the current time where missing.
    pub fn stamped(self) -> Self {
        Self {
            id: self.id.or_else(|| Some(Uuid::new_v4().to_string())),
            timestamp: self.timestamp.or_else(|| Some(Utc::now())),
            ..self
        }
    }

    /// Same metadata, different payload.
    pub fn with_payload(self, payload: Value) -> Self {
        Self {
            payload: Arc::new(payload),
            ..self
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.payload.as_ref())
    }
}
