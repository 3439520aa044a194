//! Ack layer: wrapped sends resolve with the peer's ack or time out with
//! `AckFailed`, and inbound ack requests are delivered then acknowledged.

use std::time::{Duration, Instant};

use tether::wire::{JsonWire, WireFormat, WireMessage};
use tether::{AckPayload, Client, ConnectionSettings, InMessage, OutMessage, Outcome, Throttle};
use tether_test_utils::{Behavior, GREETING_ACK_ID, MockWsServer};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn client_for(server: &MockWsServer) -> Client {
    Client::new(
        ConnectionSettings::builder(server.url())
            .throttle(Throttle::None)
            .build(),
    )
}

async fn await_event(
    rx: &mut broadcast::Receiver<InMessage>,
    mut matches: impl FnMut(&InMessage) -> bool,
) -> InMessage {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acked_send_resolves_success_without_ack_failed() {
    let server = MockWsServer::start(Behavior::Ack).await.unwrap();
    let client = client_for(&server);
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    await_event(&mut events, |e| *e == InMessage::Connected).await;

    let outcome = client
        .send(OutMessage::ackable_text("x", Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Success);

    // Give a late AckFailed a window to (incorrectly) show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut late = Vec::new();
    while let Ok(event) = events.try_recv() {
        late.push(event);
    }
    assert!(
        !late.iter().any(|e| matches!(e, InMessage::AckFailed(_))),
        "unexpected AckFailed after a successful ack: {late:?}"
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn unacked_send_times_out_with_ack_failed() {
    let server = MockWsServer::start(Behavior::Swallow).await.unwrap();
    let client = client_for(&server);
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    await_event(&mut events, |e| *e == InMessage::Connected).await;

    let started = Instant::now();
    let outcome = client
        .send(OutMessage::ackable_text("y", Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "ack timeout fired late: {:?}",
        started.elapsed()
    );

    let failed = await_event(&mut events, |e| matches!(e, InMessage::AckFailed(_))).await;
    assert_eq!(
        failed,
        InMessage::AckFailed(AckPayload::Text {
            content: "y".to_owned()
        })
    );
    // The transport survives an ack timeout.
    assert!(client.is_connected());

    client.close().await.unwrap();
}

#[tokio::test]
async fn inbound_ack_request_is_delivered_then_acknowledged() {
    let server = MockWsServer::start(Behavior::Greet).await.unwrap();
    let client = client_for(&server);
    let mut events = client.subscribe();

    client.connect().await.unwrap();

    // The greeting's inner payload reaches the receive stream.
    let delivered = await_event(&mut events, |e| matches!(e, InMessage::Text(_))).await;
    assert_eq!(delivered, InMessage::Text("welcome".to_owned()));

    // And the client answered with the matching ack envelope.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let acked = server.received_texts().iter().any(|raw| {
                matches!(
                    JsonWire.parse_in_message(raw),
                    WireMessage::Ack { id } if id == GREETING_ACK_ID
                )
            });
            if acked {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server never received the ack");

    client.close().await.unwrap();
}

#[tokio::test]
async fn ack_ids_increase_per_send() {
    let server = MockWsServer::start(Behavior::Ack).await.unwrap();
    let client = client_for(&server);
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    await_event(&mut events, |e| *e == InMessage::Connected).await;

    for text in ["one", "two", "three"] {
        let outcome = client
            .send(OutMessage::ackable_text(text, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    let ids: Vec<u64> = server
        .received_texts()
        .iter()
        .filter_map(|raw| match JsonWire.parse_in_message(raw) {
            WireMessage::AckRequest { id, .. } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    client.close().await.unwrap();
}
