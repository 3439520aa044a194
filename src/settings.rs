//! Connection settings.
//!
//! A plain immutable record built once per client.  Everything the driver
//! needs is captured here: endpoint, protocol version, upgrade headers,
//! subprotocol offer, ping interval, reconnect throttle, optional backup
//! buffer, wire format, and the executor to spawn onto.

use crate::buffer::BackupBuffer;
use crate::throttle::Throttle;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_wire::{JsonWire, WireFormat};

/// WebSocket protocol version to negotiate.
///
/// The delegated frame codec speaks RFC 6455 only; `V00` (legacy hixie-76)
/// is accepted in settings for wire compatibility with old configs but
/// rejected at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// Legacy hixie-76 (unsupported by the codec).
    V00,
    /// RFC 6455.
    #[default]
    V13,
}

/// Immutable per-client connection settings.
pub struct ConnectionSettings {
    /// Endpoint URI (`ws://` or `wss://`).  An empty path is rewritten to
    /// `/` when the upgrade request is built.
    pub uri: String,
    pub version: ProtocolVersion,
    /// Headers included verbatim in the upgrade request.
    pub initial_headers: Vec<(String, String)>,
    /// Subprotocol offer, joined with `,` for negotiation.  Empty means
    /// no `Sec-WebSocket-Protocol` header.
    pub protocols: Vec<String>,
    /// Idle duration after which a ping is emitted.
    pub pinging: Duration,
    /// Reconnect schedule.  `Throttle::None` disables automatic reconnect.
    pub throttle: Throttle,
    pub(crate) buffer: Mutex<Option<Box<dyn BackupBuffer>>>,
    pub(crate) wire: Arc<dyn WireFormat>,
    pub(crate) executor: Option<tokio::runtime::Handle>,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("initial_headers", &self.initial_headers)
            .field("protocols", &self.protocols)
            .field("pinging", &self.pinging)
            .field("throttle", &self.throttle)
            .field("buffer", &self.has_buffer())
            .finish_non_exhaustive()
    }
}

impl ConnectionSettings {
    pub fn builder(uri: impl Into<String>) -> SettingsBuilder {
        SettingsBuilder {
            uri: uri.into(),
            version: ProtocolVersion::default(),
            initial_headers: Vec::new(),
            protocols: Vec::new(),
            pinging: Duration::from_secs(30),
            throttle: Throttle::Indefinite {
                initial: Duration::from_millis(500),
                cap: Duration::from_secs(30),
            },
            buffer: None,
            wire: Arc::new(JsonWire),
            executor: None,
        }
    }

    /// Whether sends made while disconnected are retained for replay.
    pub fn has_buffer(&self) -> bool {
        self.buffer.lock().unwrap().is_some()
    }
}

/// Builder for [`ConnectionSettings`].
pub struct SettingsBuilder {
    uri: String,
    version: ProtocolVersion,
    initial_headers: Vec<(String, String)>,
    protocols: Vec<String>,
    pinging: Duration,
    throttle: Throttle,
    buffer: Option<Box<dyn BackupBuffer>>,
    wire: Arc<dyn WireFormat>,
    executor: Option<tokio::runtime::Handle>,
}

impl SettingsBuilder {
    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Add one header to the upgrade request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.initial_headers.push((name.into(), value.into()));
        self
    }

    /// Replace the subprotocol offer.
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn pinging(mut self, every: Duration) -> Self {
        self.pinging = every;
        self
    }

    pub fn throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Retain messages sent while disconnected in `buffer` and replay them
    /// on the next open.  Without a buffer such messages are dropped
    /// (the send still resolves `Success`).
    pub fn buffer(mut self, buffer: impl BackupBuffer + 'static) -> Self {
        self.buffer = Some(Box::new(buffer));
        self
    }

    /// Replace the default JSON wire format.
    pub fn wire(mut self, wire: impl WireFormat) -> Self {
        self.wire = Arc::new(wire);
        self
    }

    /// Spawn the connection driver (and receive dispatchers) on `handle`
    /// instead of the ambient runtime.
    pub fn executor(mut self, handle: tokio::runtime::Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    pub fn build(self) -> ConnectionSettings {
        ConnectionSettings {
            uri: self.uri,
            version: self.version,
            initial_headers: self.initial_headers,
            protocols: self.protocols,
            pinging: self.pinging,
            throttle: self.throttle,
            buffer: Mutex::new(self.buffer),
            wire: self.wire,
            executor: self.executor,
        }
    }
}
