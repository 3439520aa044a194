//! Reconnect throttling: bounded schedules give up after the configured
//! attempts, `Reconnecting` fires once per episode, and `disconnect`
//! pre-empts any pending retry.

use std::time::Duration;

use tether::{Client, ConnectionSettings, InMessage, Outcome, Phase, Throttle};
use tether_test_utils::{Behavior, MockWsServer};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// Honor RUST_LOG when debugging flakes; silent otherwise.
fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

async fn await_phase(client: &Client, phase: Phase) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.phase() != phase {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {phase:?}, stuck at {:?}", client.phase()));
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<InMessage>) -> Vec<InMessage> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_throttle_stops_after_exact_attempt_count() {
    init_tracing();
    let server = MockWsServer::start(Behavior::Reject).await.unwrap();
    // Schedule: [100ms, 200ms, terminal] — three attempts total.
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .throttle(Throttle::Backoff {
                initial: Duration::from_millis(100),
                cap: Duration::from_secs(1),
                attempts: 2,
            })
            .build(),
    );
    let mut events = client.subscribe();

    // The first attempt fails fast; the future resolves Cancelled while the
    // schedule plays out.
    assert_eq!(client.connect().await.unwrap(), Outcome::Cancelled);

    await_phase(&client, Phase::Closed).await;
    assert_eq!(server.connection_count(), 3);
    assert!(!client.is_connected());

    // Settle, then take stock of the lifecycle events.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = drain(&mut events);
    let reconnecting = seen
        .iter()
        .filter(|e| **e == InMessage::Reconnecting)
        .count();
    assert_eq!(reconnecting, 1, "events: {seen:?}");
    assert!(!seen.iter().any(|e| *e == InMessage::Connected));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, InMessage::Disconnected(_))),
        "throttle exhaustion is not a Disconnected: {seen:?}"
    );
}

#[tokio::test]
async fn no_throttle_means_a_single_attempt() {
    let server = MockWsServer::start(Behavior::Reject).await.unwrap();
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .throttle(Throttle::None)
            .build(),
    );
    let mut events = client.subscribe();

    assert_eq!(client.connect().await.unwrap(), Outcome::Cancelled);
    await_phase(&client, Phase::Closed).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 1);
    let seen = drain(&mut events);
    assert!(
        !seen.iter().any(|e| *e == InMessage::Reconnecting),
        "a terminal throttle never announces Reconnecting: {seen:?}"
    );
}

#[tokio::test]
async fn disconnect_preempts_a_pending_retry() {
    let server = MockWsServer::start(Behavior::Reject).await.unwrap();
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .throttle(Throttle::Fixed {
                delay: Duration::from_millis(300),
                attempts: 100,
            })
            .build(),
    );
    let mut events = client.subscribe();

    assert_eq!(client.connect().await.unwrap(), Outcome::Cancelled);
    let attempts_before = server.connection_count();

    // Disconnect lands inside the 300ms retry delay.
    assert_eq!(client.disconnect().await.unwrap(), Outcome::Success);
    assert!(!client.is_connected());
    assert_eq!(client.phase(), Phase::Closed);

    // No retry fires after disconnect, and no further Reconnecting shows up.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.connection_count(), attempts_before);
    let late = drain(&mut events)
        .into_iter()
        .filter(|e| *e == InMessage::Reconnecting)
        .count();
    assert!(late <= 1, "Reconnecting emitted after disconnect");

    // Disconnect is idempotent.
    assert_eq!(client.disconnect().await.unwrap(), Outcome::Success);
}

#[tokio::test]
async fn reconnect_after_throttle_exhaustion_is_cancelled() {
    let server = MockWsServer::start(Behavior::Reject).await.unwrap();
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .throttle(Throttle::Fixed {
                delay: Duration::from_millis(50),
                attempts: 1,
            })
            .build(),
    );

    client.connect().await.unwrap();
    await_phase(&client, Phase::Closed).await;

    // The schedule is spent: an explicit reconnect is refused.
    assert_eq!(client.reconnect().await.unwrap(), Outcome::Cancelled);
}

#[tokio::test]
async fn successful_open_resets_the_throttle() {
    let server = MockWsServer::start(Behavior::Echo).await.unwrap();
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .throttle(Throttle::Fixed {
                delay: Duration::from_millis(100),
                attempts: 2,
            })
            .build(),
    );
    let mut events = client.subscribe();

    assert_eq!(client.connect().await.unwrap(), Outcome::Success);

    // Burn the schedule down once: reconnect tears the transport and dials
    // again after the delay.
    assert_eq!(client.reconnect().await.unwrap(), Outcome::Success);
    assert!(client.is_connected());

    // If the reset did not happen this second cycle would exhaust it.
    assert_eq!(client.reconnect().await.unwrap(), Outcome::Success);
    assert!(client.is_connected());

    let reconnects = drain(&mut events)
        .into_iter()
        .filter(|e| *e == InMessage::Reconnecting)
        .count();
    assert_eq!(reconnects, 2, "one Reconnecting per reconnect episode");

    client.close().await.unwrap();
}
