//! Inbound frame classification.
//!
//! Pure demultiplexing: a decoded frame goes in, a routing decision comes
//! out, and the driver performs whatever I/O the decision calls for.  Keeps
//! the dispatch table testable without a socket in sight.

use crate::message::InMessage;
use tether_wire::{WireFormat, WireMessage};
use tokio_tungstenite::tungstenite::Bytes;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Debug, PartialEq)]
pub(crate) enum RouteAction {
    /// Hand the message to the application receive stream.
    Deliver(InMessage),
    /// The peer acknowledged one of our ack-wrapped sends.
    AckReceived(u64),
    /// The peer wants an ack: deliver `inner`, then send `Ack { id }` back.
    AckInbound { id: u64, inner: InMessage },
    /// Answer a ping.
    Pong(Bytes),
    /// The peer initiated the closing handshake.
    PeerClose(Option<String>),
    /// Nothing to do (pong frames).
    Ignore,
    /// Raw continuation frame; fragmentation is not reassembled.
    UnsupportedFrame,
}

pub(crate) fn route(msg: Message, wire: &dyn WireFormat) -> RouteAction {
    match msg {
        Message::Text(text) => match wire.parse_in_message(&text) {
            WireMessage::Ack { id } => RouteAction::AckReceived(id),
            WireMessage::AckRequest { id, content } => RouteAction::AckInbound {
                id,
                inner: content.into(),
            },
            WireMessage::Text { content } => RouteAction::Deliver(InMessage::Text(content)),
            WireMessage::Json { content } => RouteAction::Deliver(InMessage::Json(content)),
        },
        Message::Binary(data) => RouteAction::Deliver(InMessage::Binary(data.to_vec())),
        Message::Ping(data) => RouteAction::Pong(data),
        Message::Pong(_) => RouteAction::Ignore,
        Message::Close(frame) => {
            RouteAction::PeerClose(frame.and_then(|f| {
                if f.reason.is_empty() {
                    None
                } else {
                    Some(f.reason.to_string())
                }
            }))
        }
        Message::Frame(_) => RouteAction::UnsupportedFrame,
    }
}
