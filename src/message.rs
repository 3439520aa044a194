//! Client-facing message types.
//!
//! `InMessage` is everything the receive stream can deliver: lifecycle
//! events, application payloads, and ack-layer outcomes.  `OutMessage` is
//! everything `send` accepts.  Wire-level envelopes live in `tether-wire`;
//! these types are the client's view of them plus the events that never
//! touch the wire.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use tether_wire::AckPayload;

/// Everything the inbound event stream can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum InMessage {
    /// The connection reached Open and any buffered replay has finished.
    Connected,
    /// A reconnect episode started.  Emitted at most once per episode,
    /// before the first retry.
    Reconnecting,
    /// The connection closed for good (user disconnect or peer close with
    /// no reconnect).  Carries the peer's close reason when there was one.
    Disconnected(Option<String>),
    /// A non-fatal error surfaced from the I/O path.
    Error(String),
    /// Plain text payload from the peer.
    Text(String),
    /// Structured JSON payload from the peer.
    Json(serde_json::Value),
    /// Binary frame from the peer; bypasses the wire format.
    Binary(Vec<u8>),
    /// An ack-wrapped send was not acknowledged within its timeout.
    AckFailed(AckPayload),
}

impl From<AckPayload> for InMessage {
    fn from(payload: AckPayload) -> Self {
        match payload {
            AckPayload::Text { content } => InMessage::Text(content),
            AckPayload::Json { content } => InMessage::Json(content),
        }
    }
}

/// Everything `send` accepts.
///
/// Serializable so backup buffer implementations can persist queued
/// messages; the wire encoding of the ack wrapper is decided at replay
/// time, not at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutMessage {
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
    /// A payload that must be acknowledged by the peer within `timeout`,
    /// or the send resolves `Cancelled` and `AckFailed` is emitted.
    Ackable { inner: AckPayload, timeout: Duration },
}

impl OutMessage {
    pub fn text(content: impl Into<String>) -> Self {
        OutMessage::Text(content.into())
    }

    pub fn json(content: serde_json::Value) -> Self {
        OutMessage::Json(content)
    }

    /// Wrap a text payload in the ack envelope.
    pub fn ackable_text(content: impl Into<String>, timeout: Duration) -> Self {
        OutMessage::Ackable {
            inner: AckPayload::Text {
                content: content.into(),
            },
            timeout,
        }
    }

    /// Wrap a JSON payload in the ack envelope.
    pub fn ackable_json(content: serde_json::Value, timeout: Duration) -> Self {
        OutMessage::Ackable {
            inner: AckPayload::Json { content },
            timeout,
        }
    }
}

/// How a client operation resolved.
///
/// `Cancelled` is not an error: it means the operation was pre-empted
/// (disconnect during a reconnect delay, ack timeout, throttle exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Cancelled,
}
