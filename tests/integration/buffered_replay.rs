//! Buffered replay: sends made while the server is down are delivered in
//! order once it comes up, ahead of any later send, and `Connected` is
//! announced only after the backlog has been written.

use std::time::Duration;

use tether::wire::{JsonWire, WireFormat, WireMessage};
use tether::{
    Client, ConnectionSettings, InMessage, MemoryBuffer, OutMessage, Outcome, Throttle,
};
use tether_test_utils::{Behavior, MockWsServer};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// Honor RUST_LOG when debugging flakes; silent otherwise.
fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

/// Reserve a port the server will come up on later.
async fn reserve_addr() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Decode the text payloads a server captured back into plain contents.
fn text_contents(server: &MockWsServer) -> Vec<String> {
    server
        .received_texts()
        .iter()
        .filter_map(|raw| match JsonWire.parse_in_message(raw) {
            WireMessage::Text { content } => Some(content),
            _ => None,
        })
        .collect()
}

/// Wait until `server` has captured `n` text frames.
async fn await_text_count(server: &MockWsServer, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.received_texts().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "server captured {} frames, expected {n}",
            server.received_texts().len()
        )
    });
}

async fn await_event(
    rx: &mut broadcast::Receiver<InMessage>,
    mut matches: impl FnMut(&InMessage) -> bool,
) -> Vec<InMessage> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let done = matches(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for event");
    seen
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backlog_replays_in_order_before_new_sends() {
    init_tracing();
    let addr = reserve_addr().await;
    let settings = ConnectionSettings::builder(format!("ws://{addr}"))
        .buffer(MemoryBuffer::new())
        .throttle(Throttle::Backoff {
            initial: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            attempts: 30,
        })
        .build();
    let client = Client::new(settings);
    let mut events = client.subscribe();

    // Server down: the first attempt fails and the connect future resolves
    // Cancelled while retries continue in the background.
    assert_eq!(client.connect().await.unwrap(), Outcome::Cancelled);
    assert_eq!(
        client.send(OutMessage::text("A")).await.unwrap(),
        Outcome::Success
    );
    assert_eq!(
        client.send(OutMessage::text("B")).await.unwrap(),
        Outcome::Success
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let server = MockWsServer::start_on(&addr.to_string(), Behavior::Swallow)
        .await
        .unwrap();

    let seen = await_event(&mut events, |e| *e == InMessage::Connected).await;

    // One reconnect episode, announced exactly once.
    let reconnecting = seen
        .iter()
        .filter(|e| **e == InMessage::Reconnecting)
        .count();
    assert_eq!(reconnecting, 1);

    // A post-Connected send must land behind the replayed backlog.
    client.send(OutMessage::text("C")).await.unwrap();
    await_text_count(&server, 3).await;
    assert_eq!(text_contents(&server), vec!["A", "B", "C"]);
    assert!(client.is_connected());

    client.close().await.unwrap();
}

#[tokio::test]
async fn backlog_written_before_connect_is_replayed_on_first_open() {
    let server = MockWsServer::start(Behavior::Swallow).await.unwrap();
    let settings = ConnectionSettings::builder(server.url())
        .buffer(MemoryBuffer::new())
        .throttle(Throttle::None)
        .build();
    let client = Client::new(settings);
    let mut events = client.subscribe();

    // Queued while Idle, before the first connect.
    client.send(OutMessage::text("early")).await.unwrap();

    assert_eq!(client.connect().await.unwrap(), Outcome::Success);
    await_event(&mut events, |e| *e == InMessage::Connected).await;
    await_text_count(&server, 1).await;
    assert_eq!(text_contents(&server), vec!["early"]);

    client.close().await.unwrap();
}
