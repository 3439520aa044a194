//! Public client facade.
//!
//! `Client` is a cheap handle over the connection driver task: operations
//! are commands on an mpsc channel, each resolved through a oneshot reply.
//! The inbound event stream is a broadcast channel — install a partial
//! handler with [`Client::receive`], or tap it directly with
//! [`Client::subscribe`] / [`Client::stream`].
//!
//! # Usage
//! ```rust,no_run
//! # async fn example() -> Result<(), tether::ClientError> {
//! use tether::{Client, ConnectionSettings, InMessage, OutMessage};
//!
//! let settings = ConnectionSettings::builder("wss://example.com/sock").build();
//! let client = Client::new(settings);
//! client.receive(|msg| match msg {
//!     InMessage::Text(t) => { println!("peer says: {t}"); true }
//!     _ => false,
//! });
//! client.connect().await?;
//! client.send(OutMessage::text("hello")).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::driver::{Command, ConnectionDriver, Phase};
use crate::error::ClientError;
use crate::message::{InMessage, OutMessage, Outcome};
use crate::settings::ConnectionSettings;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// Bound on the terminal close: disconnect plus driver teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the inbound event fanout before slow receivers start
/// missing events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A resilient WebSocket client.
///
/// One `Client` owns at most one transport at a time; reconnection,
/// buffering and ack tracking all happen inside its driver task.
pub struct Client {
    settings: Arc<ConnectionSettings>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<InMessage>,
    phase_rx: watch::Receiver<Phase>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Client {
    /// Create the client and spawn its connection driver.  No I/O happens
    /// until [`connect`](Client::connect) is called.
    pub fn new(settings: ConnectionSettings) -> Self {
        let buffer = settings.buffer.lock().unwrap().take();
        let wire = settings.wire.clone();
        let executor = settings.executor.clone();
        let settings = Arc::new(settings);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);

        let driver = ConnectionDriver::new(
            settings.clone(),
            wire,
            buffer,
            cmd_rx,
            events.clone(),
            phase_tx,
        );
        let handle = match &executor {
            Some(handle) => handle.spawn(driver.run()),
            None => tokio::spawn(driver.run()),
        };

        Client {
            settings,
            cmd_tx,
            events,
            phase_rx,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// The immutable settings this client was built with.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Drive the connection to Open.
    ///
    /// Resolves `Success` once the handshake completes and any buffered
    /// backlog has been replayed.  If the attempt fails within its 5 s
    /// budget the future resolves `Cancelled` while reconnection (per the
    /// throttle) continues in the background.  Idempotent when already
    /// Open.
    pub async fn connect(&self) -> Result<Outcome, ClientError> {
        self.command(Command::Connect).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Resolves `Success` even when already closed.  Pre-empts an in-flight
    /// reconnect delay.
    pub async fn disconnect(&self) -> Result<Outcome, ClientError> {
        match self.command(Command::Disconnect).await {
            Err(ClientError::Closed) => Ok(Outcome::Success),
            other => other,
        }
    }

    /// Tear the current transport down and dial again after the next
    /// throttle delay.  Resolves `Cancelled` when the throttle is terminal.
    pub async fn reconnect(&self) -> Result<Outcome, ClientError> {
        self.command(Command::Reconnect).await
    }

    /// Send a message.
    ///
    /// While Open this resolves once the transport accepts the frame (or,
    /// for [`OutMessage::Ackable`], once the ack arrives — `Cancelled` when
    /// the ack timer fires instead).  While disconnected the message goes
    /// to the backup buffer when one is configured; without a buffer it is
    /// dropped and the send still resolves `Success`.
    pub async fn send(&self, msg: OutMessage) -> Result<Outcome, ClientError> {
        self.command(|reply| Command::Send(msg, reply)).await
    }

    /// Terminal shutdown: disconnect (bounded at 30 s), stop the driver
    /// task and wait for it to finish.  The client is unusable afterwards.
    pub async fn close(&self) -> Result<Outcome, ClientError> {
        let outcome = match tokio::time::timeout(CLOSE_TIMEOUT, self.disconnect()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("disconnect timed out during close");
                Outcome::Cancelled
            }
        };
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        let handle = self.driver.lock().expect("driver handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(outcome)
    }

    /// Whether the connection is currently Open.
    pub fn is_connected(&self) -> bool {
        *self.phase_rx.borrow() == Phase::Open
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    /// Install a partial handler for the inbound event stream.
    ///
    /// The handler sees every event (lifecycle and payloads, in wire
    /// order) and returns whether it handled it; unhandled events fall
    /// through silently.  Events emitted before any handler or subscriber
    /// exists are dropped.
    pub fn receive<F>(&self, mut handler: F)
    where
        F: FnMut(InMessage) -> bool + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        let dispatch = async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        let _ = handler(msg);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "receive handler lagging; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        match &self.settings.executor {
            Some(handle) => {
                handle.spawn(dispatch);
            }
            None => {
                tokio::spawn(dispatch);
            }
        }
    }

    /// Tap the raw event fanout.
    pub fn subscribe(&self) -> broadcast::Receiver<InMessage> {
        self.events.subscribe()
    }

    /// The event fanout as a `Stream`.  Lagged gaps are skipped.
    pub fn stream(&self) -> impl Stream<Item = InMessage> + Send + use<> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| std::future::ready(item.ok()))
    }

    async fn command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<Outcome, ClientError>>) -> Command,
    ) -> Result<Outcome, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }
}
