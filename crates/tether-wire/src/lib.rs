// tether-wire: text-frame payload envelopes and the codec seam.
//
// Every ack-capable message travels inside a text frame as a JSON object
// with a top-level `kind` field for discriminated deserialization.  The
// `WireFormat` trait is the plug point for alternative encodings; `JsonWire`
// is the default.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Payloads carried by ack envelopes
// ---------------------------------------------------------------------------

/// An application payload eligible for ack wrapping.
///
/// Binary frames bypass the text codec entirely, so only text and JSON
/// payloads appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum AckPayload {
    Text { content: String },
    Json { content: serde_json::Value },
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All message kinds that travel inside a text frame.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "ack_request", "id": 7, "content": { "kind": "text", "content": "hi" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    /// Plain text payload.
    Text { content: String },
    /// Structured JSON payload.
    Json { content: serde_json::Value },
    /// Acknowledgement of a previously received `AckRequest`.
    Ack { id: u64 },
    /// A payload that must be acknowledged by the peer with `Ack { id }`.
    AckRequest { id: u64, content: AckPayload },
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrenderable message: {0}")]
    Unrenderable(String),
}

// ---------------------------------------------------------------------------
// WireFormat trait
// ---------------------------------------------------------------------------

/// The codec translating application messages to and from text frame
/// payloads.
///
/// `parse_in_message` is total: input that does not parse as an envelope is
/// classified as a plain text payload so a misbehaving peer cannot take the
/// transport down.  `render` is the inverse for every renderable message:
/// `parse_in_message(render(x)) == x`.
pub trait WireFormat: Send + Sync + 'static {
    /// Classify a text frame payload.
    fn parse_in_message(&self, raw: &str) -> WireMessage;

    /// Serialize an outbound message into a text frame payload.
    fn render(&self, msg: &WireMessage) -> Result<String, WireError>;
}

/// The default wire format: one JSON object per text frame, discriminated
/// by `kind`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWire;

impl WireFormat for JsonWire {
    fn parse_in_message(&self, raw: &str) -> WireMessage {
        serde_json::from_str(raw).unwrap_or_else(|_| WireMessage::Text {
            content: raw.to_owned(),
        })
    }

    fn render(&self, msg: &WireMessage) -> Result<String, WireError> {
        Ok(serde_json::to_string(msg)?)
    }
}
