//! Idle pinging: a quiet transport is probed on the configured interval
//! and stays Open throughout.

use std::time::Duration;

use tether::{Client, ConnectionSettings, InMessage, OutMessage, Outcome, Throttle};
use tether_test_utils::{Behavior, MockWsServer};

#[tokio::test]
async fn idle_transport_is_pinged_and_stays_open() {
    let server = MockWsServer::start(Behavior::Echo).await.unwrap();
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .pinging(Duration::from_millis(200))
            .throttle(Throttle::None)
            .build(),
    );
    let mut events = client.subscribe();

    assert_eq!(client.connect().await.unwrap(), Outcome::Success);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if events.recv().await.unwrap() == InMessage::Connected {
                break;
            }
        }
    })
    .await
    .unwrap();

    // Stay idle well past two intervals.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        server.ping_count() >= 2,
        "expected at least 2 pings, saw {}",
        server.ping_count()
    );
    assert!(client.is_connected());

    // The connection is still usable after the idle stretch.
    assert_eq!(
        client.send(OutMessage::text("after idle")).await.unwrap(),
        Outcome::Success
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if events.recv().await.unwrap() == InMessage::Text("after idle".to_owned()) {
                break;
            }
        }
    })
    .await
    .unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn active_traffic_suppresses_pinging() {
    let server = MockWsServer::start(Behavior::Echo).await.unwrap();
    let client = Client::new(
        ConnectionSettings::builder(server.url())
            .pinging(Duration::from_millis(300))
            .throttle(Throttle::None)
            .build(),
    );

    client.connect().await.unwrap();

    // Chatter faster than the idle threshold for ~600ms.
    for _ in 0..6 {
        client.send(OutMessage::text("busy")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(server.ping_count(), 0, "pinged despite steady traffic");

    client.close().await.unwrap();
}
