//! tether: a resilient WebSocket client.
//!
//! Maintains a logical connection across transient network failures with
//! reconnect throttling, offline message buffering, idle ping/pong, and an
//! application-level ack layer on top of text frames.
//!
//! The moving parts:
//! - [`Client`] — the public facade: `connect` / `disconnect` /
//!   `reconnect` / `send` / `close`, plus the inbound event stream.
//! - [`ConnectionSettings`] — immutable per-client configuration, built
//!   with [`ConnectionSettings::builder`].
//! - [`Throttle`] — the reconnect delay schedule.
//! - [`BackupBuffer`] — FIFO for messages sent while disconnected,
//!   replayed before `Connected` is announced.
//! - `tether-wire` (re-exported as [`wire`]) — the pluggable text-frame
//!   codec.

mod ack;
pub mod buffer;
pub mod client;
mod driver;
mod error;
mod handshake;
pub mod message;
mod ping;
mod router;
pub mod settings;
pub mod throttle;

pub use buffer::{BackupBuffer, BufferError, MemoryBuffer, SqliteBuffer};
pub use client::Client;
pub use driver::Phase;
pub use error::ClientError;
pub use message::{AckPayload, InMessage, OutMessage, Outcome};
pub use settings::{ConnectionSettings, ProtocolVersion, SettingsBuilder};
pub use throttle::{Throttle, humanize};

pub use tether_wire as wire;
