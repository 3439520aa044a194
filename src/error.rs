//! Public error type for client operations.

use crate::buffer::BufferError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// TCP-level failure: connect refused, reset, unexpected close.
    #[error("transport: {0}")]
    Transport(String),
    /// The HTTP upgrade failed or the endpoint configuration cannot be
    /// handshaken (bad header value, unsupported protocol version).
    #[error("handshake: {0}")]
    Handshake(String),
    /// The peer violated the frame protocol after the upgrade.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The endpoint URI did not parse or is not a ws/wss URI.
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("wire: {0}")]
    Wire(#[from] tether_wire::WireError),
    #[error("buffer: {0}")]
    Buffer(#[from] BufferError),
    /// The client handle has been closed and its driver task is gone.
    #[error("client closed")]
    Closed,
}
