//! Wire encoding for envelopes.
//!
//! The bus never assumes a wire format; it holds a `Box<dyn Codec>`.
//! Implementations must round-trip: `decode(encode(e)) == e`.

use bytes::Bytes;

use super::envelope::Envelope;

/// A frame could not be turned into an envelope.
#[derive(Debug, thiserror::Error)]
#[error("Failed to decode frame ({len} bytes): {reason}")]
pub struct DecodeError {
    pub len: usize,
    pub reason: String,
}

/// An envelope could not be turned into a frame.
#[derive(Debug, thiserror::Error)]
#[error("Failed to encode envelope for topic '{topic}': {reason}")]
pub struct EncodeError {
    pub topic: String,
    pub reason: String,
}

/// Converts envelopes to and from transport frames.
pub trait Codec: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Bytes, EncodeError>;

    fn decode(&self, frame: &[u8]) -> Result<Envelope, DecodeError>;
}

/// JSON objects: `{"topic": ..., "payload": ..., "id"?: ..., "timestamp"?: ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Bytes, EncodeError> {
        serde_json::to_vec(envelope)
            .map(Bytes::from)
            .map_err(|e| EncodeError {
                topic: envelope.topic().to_string(),
                reason: e.to_string(),
            })
    }

    fn decode(&self, frame: &[u8]) -> Result<Envelope, DecodeError> {
        serde_json::from_slice(frame).map_err(|e| DecodeError {
            len: frame.len(),
            reason: e.to_string(),
        })
    }
}
