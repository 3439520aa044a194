//! The connection lifecycle state machine.
//!
//! One driver task owns everything mutable about a logical connection:
//! phase, transport, throttle position, ack registry, idle tracking, and
//! the list of callers waiting on the connected signal.  Commands from the
//! facade arrive on an mpsc channel, so `connect`/`disconnect`/`reconnect`
//! are serialized by construction, and the reconnect delay is one select
//! arm so a disconnect pre-empts it.
//!
//! # Phases
//!
//! ```text
//! Idle --connect--> Connecting --tcp-ok--> Handshaking --upgrade-ok--> Open
//! Connecting/Handshaking --fail--> Reconnecting (throttle not terminal) | Closed
//! Open --peer-close | transport-error--> Reconnecting (unless closing) | Closed
//! Open --user-disconnect--> Closing --> Closed
//! Reconnecting --delay-elapsed--> Connecting
//! ```

use crate::ack::AckRegistry;
use crate::error::ClientError;
use crate::handshake;
use crate::message::{InMessage, OutMessage, Outcome};
use crate::ping::IdleTracker;
use crate::router::{self, RouteAction};
use crate::settings::ConnectionSettings;
use crate::throttle::{Throttle, humanize};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_wire::{AckPayload, WireFormat, WireMessage};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls_with_config};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Wall-clock budget for one TCP connect + upgrade attempt.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<Outcome, ClientError>>;

/// Connection lifecycle phase, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Handshaking,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

/// Facade-to-driver commands.
pub(crate) enum Command {
    Connect(Reply),
    Disconnect(Reply),
    Reconnect(Reply),
    Send(OutMessage, Reply),
    Shutdown(oneshot::Sender<()>),
}

enum Tick {
    Cmd(Option<Command>),
    Frame(Option<Result<Message, WsError>>),
    Retry,
    AckDeadline,
    PingDue,
}

pub(crate) struct ConnectionDriver {
    settings: Arc<ConnectionSettings>,
    wire: Arc<dyn WireFormat>,
    buffer: Option<Box<dyn crate::buffer::BackupBuffer>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<InMessage>,
    phase_tx: watch::Sender<Phase>,

    transport: Option<WsStream>,
    session_id: Option<Uuid>,
    acks: AckRegistry,
    idle: IdleTracker,
    current_throttle: Throttle,
    retry_at: Option<Instant>,
    is_closing: bool,
    is_reconnecting: bool,
    reconnecting_emitted: bool,
    connected_waiters: Vec<Reply>,
}

impl ConnectionDriver {
    pub fn new(
        settings: Arc<ConnectionSettings>,
        wire: Arc<dyn WireFormat>,
        buffer: Option<Box<dyn crate::buffer::BackupBuffer>>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<InMessage>,
        phase_tx: watch::Sender<Phase>,
    ) -> Self {
        let idle = IdleTracker::new(settings.pinging);
        let current_throttle = settings.throttle.clone();
        ConnectionDriver {
            settings,
            wire,
            buffer,
            cmd_rx,
            events,
            phase_tx,
            transport: None,
            session_id: None,
            acks: AckRegistry::new(),
            idle,
            current_throttle,
            retry_at: None,
            is_closing: false,
            is_reconnecting: false,
            reconnecting_emitted: false,
            connected_waiters: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            let ack_at = self.acks.next_deadline();
            let ping_at = if self.transport.is_some() {
                Some(self.idle.deadline())
            } else {
                None
            };

            let tick = {
                let Self {
                    cmd_rx, transport, ..
                } = &mut self;
                tokio::select! {
                    biased;
                    cmd = cmd_rx.recv() => Tick::Cmd(cmd),
                    frame = next_frame(transport) => Tick::Frame(frame),
                    () = sleep_at(retry_at) => Tick::Retry,
                    () = sleep_at(ack_at) => Tick::AckDeadline,
                    () = sleep_at(ping_at) => Tick::PingDue,
                }
            };

            match tick {
                Tick::Cmd(None) => {
                    self.shutdown().await;
                    return;
                }
                Tick::Cmd(Some(Command::Shutdown(done))) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Tick::Cmd(Some(Command::Connect(reply))) => self.handle_connect(reply).await,
                Tick::Cmd(Some(Command::Disconnect(reply))) => self.handle_disconnect(reply).await,
                Tick::Cmd(Some(Command::Reconnect(reply))) => self.handle_reconnect(reply).await,
                Tick::Cmd(Some(Command::Send(msg, reply))) => self.handle_send(msg, reply).await,
                Tick::Frame(frame) => self.handle_frame(frame).await,
                Tick::Retry => {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
                Tick::AckDeadline => self.expire_acks(),
                Tick::PingDue => self.emit_ping().await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Command handling
    // -----------------------------------------------------------------------

    async fn handle_connect(&mut self, reply: Reply) {
        if self.phase() == Phase::Open {
            let _ = reply.send(Ok(Outcome::Success));
            return;
        }
        if let Err(e) = self.validate_settings() {
            let _ = reply.send(Err(e));
            return;
        }
        self.retry_at = None;
        self.connected_waiters.push(reply);
        self.attempt_connect().await;
    }

    async fn handle_disconnect(&mut self, reply: Reply) {
        // Already settled: succeed without replaying the Closed transition.
        if matches!(self.phase(), Phase::Idle | Phase::Closed)
            && self.transport.is_none()
            && self.retry_at.is_none()
        {
            let _ = reply.send(Ok(Outcome::Success));
            return;
        }
        self.is_closing = true;
        self.retry_at = None;
        if let Some(mut ws) = self.transport.take() {
            self.set_phase(Phase::Closing);
            info!(session_id = ?self.session_id, "closing connection");
            // Sends the close frame and flushes before we let go of the stream.
            if let Err(e) = ws.close(None).await {
                debug!(error = %e, "close frame write failed");
            }
        }
        self.resolve_waiters(Outcome::Cancelled);
        self.is_reconnecting = false;
        self.transition_closed(None);
        let _ = reply.send(Ok(Outcome::Success));
    }

    async fn handle_reconnect(&mut self, reply: Reply) {
        if let Err(e) = self.validate_settings() {
            let _ = reply.send(Err(e));
            return;
        }
        if !self.is_reconnecting {
            self.is_reconnecting = true;
            self.reconnecting_emitted = true;
            self.emit(InMessage::Reconnecting);
        }
        if let Some(mut ws) = self.transport.take() {
            self.session_id = None;
            if let Err(e) = ws.close(None).await {
                debug!(error = %e, "close frame write failed");
            }
        }
        match self.current_throttle.step() {
            Some((delay, next)) => {
                info!(delay = %humanize(delay), "reconnect scheduled");
                self.current_throttle = next;
                self.retry_at = Some(Instant::now() + delay);
                self.set_phase(Phase::Reconnecting);
                self.connected_waiters.push(reply);
            }
            None => {
                let _ = reply.send(Ok(Outcome::Cancelled));
                self.resolve_waiters(Outcome::Cancelled);
                self.transition_closed(None);
            }
        }
    }

    async fn handle_send(&mut self, msg: OutMessage, reply: Reply) {
        if self.phase() != Phase::Open || self.transport.is_none() {
            match self.buffer.as_mut() {
                Some(buffer) => {
                    let result = buffer
                        .write(msg)
                        .map(|()| Outcome::Success)
                        .map_err(ClientError::from);
                    let _ = reply.send(result);
                }
                None => {
                    debug!("not connected and no backup buffer; message dropped");
                    let _ = reply.send(Ok(Outcome::Success));
                }
            }
            return;
        }
        if let Err(e) = self.transmit(msg, Some(reply)).await {
            self.transport_lost(Some(e));
        }
    }

    // -----------------------------------------------------------------------
    // Connecting
    // -----------------------------------------------------------------------

    fn validate_settings(&self) -> Result<(), ClientError> {
        handshake::ensure_supported(self.settings.version)?;
        let uri = handshake::normalized_uri(&self.settings.uri)?;
        handshake::endpoint(&uri)?;
        Ok(())
    }

    async fn attempt_connect(&mut self) {
        // A fresh attempt always discards any leftover closing intent.
        self.is_closing = false;
        self.set_phase(Phase::Connecting);
        let deadline = Instant::now() + CONNECT_TIMEOUT;

        let (uri, endpoint) = match handshake::normalized_uri(&self.settings.uri)
            .and_then(|uri| handshake::endpoint(&uri).map(|ep| (uri, ep)))
        {
            Ok(pair) => pair,
            Err(e) => {
                self.connect_failed(e.to_string(), false);
                return;
            }
        };

        debug!(host = %endpoint.host, port = endpoint.port, "dialing");
        let tcp = match timeout_at(
            deadline,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let refused = e.kind() == std::io::ErrorKind::ConnectionRefused;
                self.connect_failed(e.to_string(), refused && self.is_reconnecting);
                return;
            }
            Err(_) => {
                self.connect_failed("connect timed out".to_owned(), false);
                return;
            }
        };

        self.set_phase(Phase::Handshaking);
        let request = match handshake::build_request(&uri, &self.settings) {
            Ok(request) => request,
            Err(e) => {
                self.connect_failed(e.to_string(), false);
                return;
            }
        };
        let (ws, response) =
            match timeout_at(deadline, client_async_tls_with_config(request, tcp, None, None)).await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    self.connect_failed(format!("upgrade failed: {e}"), false);
                    return;
                }
                Err(_) => {
                    self.connect_failed("handshake timed out".to_owned(), false);
                    return;
                }
            };

        match handshake::negotiated_subprotocol(&response, &self.settings.protocols) {
            Ok(subprotocol) => self.enter_open(ws, subprotocol).await,
            Err(e) => self.connect_failed(e.to_string(), false),
        }
    }

    /// Log and surface a failed attempt, then consult the throttle.
    ///
    /// `silent` covers expected retry noise (connection refused while a
    /// reconnect cycle is in progress); everything else reaches the
    /// application stream as an `Error` event.
    fn connect_failed(&mut self, cause: String, silent: bool) {
        if silent {
            debug!(error = %cause, "connection attempt failed (retrying)");
        } else {
            warn!(error = %cause, "connection attempt failed");
            self.emit(InMessage::Error(cause));
        }
        self.schedule_reconnect();
    }

    async fn enter_open(&mut self, ws: WsStream, subprotocol: Option<String>) {
        let session_id = Uuid::new_v4();
        self.transport = Some(ws);
        self.session_id = Some(session_id);
        self.idle = IdleTracker::new(self.settings.pinging);
        // Successful open rewinds the throttle for the next episode.
        self.current_throttle = self.settings.throttle.clone();
        self.set_phase(Phase::Open);
        info!(
            session_id = %session_id,
            subprotocol = subprotocol.as_deref().unwrap_or("-"),
            "connection open"
        );

        // Replay everything buffered while disconnected, ahead of any send
        // issued after `Connected` is observed.
        let mut backlog: VecDeque<OutMessage> = VecDeque::new();
        if let Some(buffer) = self.buffer.as_mut() {
            if let Err(e) = buffer.open() {
                warn!(error = %e, "buffer open failed");
            }
            match buffer.drain() {
                Ok(pending) => backlog = pending.into(),
                Err(e) => warn!(error = %e, "buffer drain failed"),
            }
        }
        if !backlog.is_empty() {
            debug!(n = backlog.len(), "replaying buffered messages");
        }
        while let Some(msg) = backlog.pop_front() {
            if let Err(e) = self.transmit(msg, None).await {
                // The failed message was re-buffered by transmit; keep the
                // rest queued for the next attempt, in order.
                if let Some(buffer) = self.buffer.as_mut() {
                    while let Some(rest) = backlog.pop_front() {
                        if let Err(e) = buffer.write(rest) {
                            warn!(error = %e, "re-buffering failed; message lost");
                        }
                    }
                }
                self.transport_lost(Some(e));
                return;
            }
        }

        self.is_reconnecting = false;
        self.reconnecting_emitted = false;
        self.resolve_waiters(Outcome::Success);
        self.emit(InMessage::Connected);
    }

    // -----------------------------------------------------------------------
    // Open-phase I/O
    // -----------------------------------------------------------------------

    async fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        let msg = match frame {
            None => {
                // Stream ended without a close frame: the peer is gone.
                self.transport_lost(None);
                return;
            }
            Some(Err(e)) => {
                self.transport_lost(Some(e));
                return;
            }
            Some(Ok(msg)) => msg,
        };
        self.idle.mark_read();

        match router::route(msg, self.wire.as_ref()) {
            RouteAction::Deliver(in_msg) => self.emit(in_msg),
            RouteAction::AckReceived(id) => {
                if !self.acks.acknowledge(id) {
                    debug!(id, "ack for unknown or already-resolved id ignored");
                }
            }
            RouteAction::AckInbound { id, inner } => {
                self.emit(inner);
                match self.wire.render(&WireMessage::Ack { id }) {
                    Ok(raw) => {
                        if let Err(e) = self.send_frame(Message::Text(raw.into())).await {
                            self.transport_lost(Some(e));
                        }
                    }
                    Err(e) => warn!(id, error = %e, "could not render ack"),
                }
            }
            RouteAction::Pong(data) => {
                if let Err(e) = self.send_frame(Message::Pong(data)).await {
                    self.transport_lost(Some(e));
                }
            }
            RouteAction::PeerClose(reason) => self.peer_close(reason),
            RouteAction::Ignore => {}
            RouteAction::UnsupportedFrame => {
                warn!("continuation frame dropped; fragmented messages are not reassembled");
            }
        }
    }

    fn peer_close(&mut self, reason: Option<String>) {
        info!(session_id = ?self.session_id, reason = ?reason, "peer closed connection");
        self.transport = None;
        self.session_id = None;
        if self.is_closing {
            self.is_reconnecting = false;
            self.transition_closed(reason);
        } else {
            self.schedule_reconnect();
        }
    }

    /// Write one outbound message to the open transport.
    ///
    /// Resolves `reply` on success (immediately for plain messages, via the
    /// ack registry for ack-wrapped ones).  On a write failure the message
    /// is diverted to the backup buffer when one exists — the reply then
    /// resolves `Success` and the caller tears the transport down.
    async fn transmit(&mut self, msg: OutMessage, reply: Option<Reply>) -> Result<(), WsError> {
        let (frame, armed) = match self.encode(&msg) {
            Ok(pair) => pair,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return Ok(());
            }
        };

        match self.send_frame(frame).await {
            Ok(()) => {
                match armed {
                    Some((id, payload, timeout)) => {
                        // Invariant: every AckRequest on the wire has a
                        // timer armed.
                        let reply = reply.unwrap_or_else(discarded_reply);
                        self.acks.register(id, payload, timeout, reply);
                    }
                    None => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(Outcome::Success));
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "transport write failed");
                match self.buffer.as_mut() {
                    Some(buffer) => {
                        if let Err(be) = buffer.write(msg) {
                            warn!(error = %be, "diverting failed send to buffer failed");
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(Outcome::Success));
                        }
                    }
                    None => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(ClientError::Transport(e.to_string())));
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Render an outbound message to a frame; ack-wrapped messages also
    /// reserve their id here so the envelope carries it.
    #[allow(clippy::type_complexity)]
    fn encode(
        &mut self,
        msg: &OutMessage,
    ) -> Result<(Message, Option<(u64, AckPayload, Duration)>), ClientError> {
        match msg {
            OutMessage::Binary(data) => Ok((Message::Binary(data.clone().into()), None)),
            OutMessage::Text(content) => {
                let raw = self.wire.render(&WireMessage::Text {
                    content: content.clone(),
                })?;
                Ok((Message::Text(raw.into()), None))
            }
            OutMessage::Json(content) => {
                let raw = self.wire.render(&WireMessage::Json {
                    content: content.clone(),
                })?;
                Ok((Message::Text(raw.into()), None))
            }
            OutMessage::Ackable { inner, timeout } => {
                let id = self.acks.allocate_id();
                let raw = self.wire.render(&WireMessage::AckRequest {
                    id,
                    content: inner.clone(),
                })?;
                Ok((Message::Text(raw.into()), Some((id, inner.clone(), *timeout))))
            }
        }
    }

    async fn send_frame(&mut self, frame: Message) -> Result<(), WsError> {
        match self.transport.as_mut() {
            Some(ws) => {
                ws.send(frame).await?;
                self.idle.mark_write();
                Ok(())
            }
            None => Err(WsError::AlreadyClosed),
        }
    }

    async fn emit_ping(&mut self) {
        debug!(session_id = ?self.session_id, "transport idle; sending ping");
        self.idle.mark_ping();
        if let Err(e) = self.send_frame(Message::Ping(Default::default())).await {
            self.transport_lost(Some(e));
        }
    }

    fn expire_acks(&mut self) {
        for expired in self.acks.expired(Instant::now()) {
            warn!(id = expired.id, "ack timed out");
            self.emit(InMessage::AckFailed(expired.payload));
            let _ = expired.reply.send(Ok(Outcome::Cancelled));
        }
    }

    // -----------------------------------------------------------------------
    // Failure and teardown transitions
    // -----------------------------------------------------------------------

    fn transport_lost(&mut self, error: Option<WsError>) {
        self.transport = None;
        self.session_id = None;
        if self.is_closing {
            // ClosedChannel noise during a user-initiated close is expected.
            if let Some(e) = error {
                debug!(error = %e, "transport error during close");
            }
            self.is_reconnecting = false;
            self.transition_closed(None);
            return;
        }
        if let Some(e) = error {
            warn!(error = %e, "transport lost");
            self.emit(InMessage::Error(e.to_string()));
        } else {
            info!("transport closed by peer");
        }
        self.schedule_reconnect();
    }

    /// Consult the throttle and either schedule the next attempt or give up.
    fn schedule_reconnect(&mut self) {
        if self.is_closing {
            self.is_reconnecting = false;
            self.transition_closed(None);
            return;
        }
        match self.current_throttle.step() {
            Some((delay, next)) => {
                self.is_reconnecting = true;
                if !self.reconnecting_emitted {
                    self.reconnecting_emitted = true;
                    self.emit(InMessage::Reconnecting);
                }
                info!(delay = %humanize(delay), "reconnecting after delay");
                self.current_throttle = next;
                self.retry_at = Some(Instant::now() + delay);
                self.set_phase(Phase::Reconnecting);
                // Pending connects resolve now; retries continue behind them.
                self.resolve_waiters(Outcome::Cancelled);
            }
            None => {
                info!("reconnect throttle exhausted; giving up");
                self.resolve_waiters(Outcome::Cancelled);
                self.transition_closed(None);
            }
        }
    }

    /// Terminal transition into Closed.
    ///
    /// The buffer closes and `Disconnected` is emitted only when this is a
    /// real end of session, not a step inside a reconnect episode.
    fn transition_closed(&mut self, reason: Option<String>) {
        self.transport = None;
        self.session_id = None;
        self.retry_at = None;
        for reply in self.acks.clear() {
            let _ = reply.send(Ok(Outcome::Cancelled));
        }
        if !self.is_reconnecting {
            if let Some(buffer) = self.buffer.as_mut() {
                if let Err(e) = buffer.close() {
                    warn!(error = %e, "buffer close failed");
                }
            }
            self.emit(InMessage::Disconnected(reason));
        }
        self.is_reconnecting = false;
        self.reconnecting_emitted = false;
        self.set_phase(Phase::Closed);
    }

    async fn shutdown(&mut self) {
        debug!("driver shutting down");
        if let Some(mut ws) = self.transport.take() {
            let _ = ws.close(None).await;
        }
        for reply in self.acks.clear() {
            let _ = reply.send(Ok(Outcome::Cancelled));
        }
        self.resolve_waiters(Outcome::Cancelled);
        if let Some(buffer) = self.buffer.as_mut() {
            if let Err(e) = buffer.close() {
                warn!(error = %e, "buffer close failed");
            }
        }
        self.set_phase(Phase::Closed);
    }

    // -----------------------------------------------------------------------
    // Small helpers
    // -----------------------------------------------------------------------

    fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase() != phase {
            debug!(from = ?self.phase(), to = ?phase, "phase transition");
            self.phase_tx.send_replace(phase);
        }
    }

    fn emit(&self, msg: InMessage) {
        // No subscribers is fine; events are droppable until a receiver is
        // installed.
        let _ = self.events.send(msg);
    }

    fn resolve_waiters(&mut self, outcome: Outcome) {
        for waiter in self.connected_waiters.drain(..) {
            let _ = waiter.send(Ok(outcome));
        }
    }
}

/// A reply sink for replayed ack-wrapped messages whose original send
/// already resolved at enqueue time.
fn discarded_reply() -> Reply {
    let (tx, _rx) = oneshot::channel();
    tx
}

async fn next_frame(transport: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match transport.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
