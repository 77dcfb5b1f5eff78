use chrono::Utc;
use common::{OutboxEvent, OutboxStatus};
use outbox_relay::publisher::RecordingPublisher;
use outbox_relay::{InMemoryOutboxStore, OutboxRelay, OutboxStore, RelayConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn relay_drains_outbox_and_stops_on_shutdown() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let relay = Arc::new(OutboxRelay::new(
        store.clone(),
        publisher.clone(),
        RelayConfig::default(),
    ));

    let created = OutboxEvent::new("prediction.created", "p-1", json!({ "type": "rate_cut" }));
    let fulfilled = OutboxEvent::new("prediction.fulfilled", "p-1", json!({}));
    store.enqueue(created.clone()).await;
    store.enqueue(fulfilled.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run(shutdown_rx).await }
    });

    // First poll tick fires immediately
    wait_for(|| {
        let publisher = publisher.clone();
        async move { publisher.messages().await.len() == 2 }
    })
    .await;

    assert!(relay.is_running());
    assert!(relay.health().await.healthy);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert!(!relay.is_running());
    assert!(publisher.is_closed());
    assert!(!relay.health().await.healthy);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.pending, 0);
    assert_eq!(store.get(created.id).await.unwrap().status, OutboxStatus::Sent);
}

#[tokio::test]
async fn relay_keeps_running_through_store_outage() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let config = RelayConfig {
        poll_interval_secs: 1,
        ..Default::default()
    };
    let relay = Arc::new(OutboxRelay::new(store.clone(), publisher.clone(), config));

    store.set_unavailable(true);
    store
        .enqueue(OutboxEvent::new("prediction.expired", "p-2", json!({})))
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(publisher.messages().await.is_empty());
    assert!(relay.is_running());

    store.set_unavailable(false);
    wait_for(|| {
        let publisher = publisher.clone();
        async move { publisher.messages().await.len() == 1 }
    })
    .await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    let rows = store.all().await;
    assert_eq!(rows[0].status, OutboxStatus::Sent);
    assert!(rows[0].processed_at.unwrap() <= Utc::now());
}
