// mock_ws_server: A scriptable mock WebSocket server for client tests.
//
// Binds to port 0 (random) by default and exposes the actual bound address;
// each test spins up its own isolated instance.  The per-connection behavior
// is selected at start time so one server type covers every scenario:
// echoing, acking, swallowing, or refusing the upgrade outright.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tether_wire::WireMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;

/// What a connection handler does with inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Echo every text and binary frame back verbatim.
    Echo,
    /// Parse text frames as wire envelopes; answer each `ack_request` with a
    /// matching `ack`, echo everything else.
    Ack,
    /// Read and record frames but never respond.
    Swallow,
    /// Send one `ack_request` greeting right after the upgrade, then record
    /// inbound frames (the client's answering `ack` included) silently.
    Greet,
    /// Accept the TCP connection, then drop it before the upgrade completes.
    Reject,
}

/// Ack-request id used by [`Behavior::Greet`].
pub const GREETING_ACK_ID: u64 = 99;

/// A mock WebSocket server with a scripted per-connection behavior.
///
/// Counters are shared across all connections the server ever accepted, so
/// tests can assert on attempt counts and observed frames after the fact.
pub struct MockWsServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_task: tokio::task::JoinHandle<()>,
}

struct ServerState {
    behavior: Behavior,
    connections: AtomicUsize,
    pings: AtomicUsize,
    texts: Mutex<Vec<String>>,
}

impl MockWsServer {
    /// Start the server on a random available port.
    pub async fn start(behavior: Behavior) -> Result<Self, std::io::Error> {
        Self::start_on("127.0.0.1:0", behavior).await
    }

    /// Start the server on a specific address.
    ///
    /// Used by restart scenarios: reserve a port, point the client at it,
    /// then bring the server up later on that same port.
    pub async fn start_on(addr: &str, behavior: Behavior) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            behavior,
            connections: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, accept_state).await;
        });

        Ok(MockWsServer {
            addr,
            state,
            accept_task,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL for the listening address, with no path.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of TCP connections accepted so far (one per client attempt).
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of ping frames observed across all connections.
    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Raw text frame payloads received, in arrival order.
    pub fn received_texts(&self) -> Vec<String> {
        self.state.texts.lock().unwrap().clone()
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// -- internal --

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                state.connections.fetch_add(1, Ordering::SeqCst);
                if state.behavior == Behavior::Reject {
                    // Drop before the upgrade; the client sees a failed handshake.
                    drop(stream);
                    continue;
                }
                let conn_state = state.clone();
                tokio::spawn(async move {
                    // Connection errors are expected in tests (client drops,
                    // flaps mid-frame); swallow them.
                    let _ = handle_connection(stream, conn_state).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    if state.behavior == Behavior::Greet {
        let greeting = serde_json::to_string(&WireMessage::AckRequest {
            id: GREETING_ACK_ID,
            content: tether_wire::AckPayload::Text {
                content: "welcome".to_owned(),
            },
        })?;
        write.send(Message::Text(greeting.into())).await?;
    }

    while let Some(msg_result) = read.next().await {
        let msg = msg_result?;
        match msg {
            Message::Text(text) => {
                state.texts.lock().unwrap().push(text.to_string());
                match state.behavior {
                    Behavior::Echo => {
                        write.send(Message::Text(text)).await?;
                    }
                    Behavior::Ack => match serde_json::from_str::<WireMessage>(&text) {
                        Ok(WireMessage::AckRequest { id, .. }) => {
                            let ack = serde_json::to_string(&WireMessage::Ack { id })?;
                            write.send(Message::Text(ack.into())).await?;
                        }
                        _ => {
                            write.send(Message::Text(text)).await?;
                        }
                    },
                    Behavior::Swallow | Behavior::Greet => {}
                    Behavior::Reject => unreachable!("rejected before upgrade"),
                }
            }
            Message::Binary(data) => {
                if state.behavior == Behavior::Echo {
                    write.send(Message::Binary(data)).await?;
                }
            }
            Message::Ping(data) => {
                state.pings.fetch_add(1, Ordering::SeqCst);
                write.send(Message::Pong(data)).await?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
