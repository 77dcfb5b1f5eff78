use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use common::OutboxEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::publisher::{MessagePublisher, PublishError};
use crate::store::{DeliveryUpdate, OutboxStats, OutboxStore};

/// Doubling stops here; later retries wait the same
const MAX_BACKOFF_EXPONENT: i32 = 16;

/// Delay before retry number `retry_count` (1-based): `base * 2^(retry_count - 1)`
pub fn backoff_delay(base: Duration, retry_count: i32) -> Duration {
    let exponent = (retry_count - 1).clamp(0, MAX_BACKOFF_EXPONENT) as u32;
    base * 2i32.pow(exponent)
}

/// Wire format of every relayed event
#[derive(Debug, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<&OutboxEvent> for RelayMessage {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub sent: usize,
    pub retrying: usize,
    pub permanently_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayHealth {
    pub healthy: bool,
    pub running: bool,
    pub broker_connected: bool,
    pub stats: Option<OutboxStats>,
    /// Non-fatal condition an operator should look at
    pub warning: Option<String>,
}

/// Drains the outbox table to the broker.
///
/// Run exactly one relay per database: rows are selected without row locks.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: RelayConfig,
    running: AtomicBool,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<dyn MessagePublisher>, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn process_batch(&self) -> Result<BatchReport> {
        self.process_batch_at(Utc::now()).await
    }

    /// Publish every due row once and commit the outcomes together.
    ///
    /// A publish failure only affects its own row. A store failure aborts the
    /// iteration before anything is written.
    pub async fn process_batch_at(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let due = self.store.fetch_due(now, self.config.batch_size).await?;

        let mut report = BatchReport {
            fetched: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut updates = Vec::with_capacity(due.len());
        for event in &due {
            match self.deliver(event).await {
                Ok(()) => {
                    report.sent += 1;
                    updates.push(DeliveryUpdate::Sent {
                        id: event.id,
                        processed_at: now,
                    });
                }
                Err(e) => {
                    let retry_count = event.retry_count + 1;
                    if retry_count >= event.max_retries {
                        error!(
                            outbox_id = %event.id,
                            event_type = %event.event_type,
                            retry_count,
                            "Outbox event permanently failed: {}", e
                        );
                        report.permanently_failed += 1;
                        updates.push(DeliveryUpdate::PermanentlyFailed {
                            id: event.id,
                            retry_count,
                            error: e.to_string(),
                        });
                    } else {
                        let next_retry_at = now + backoff_delay(self.config.base_retry_delay(), retry_count);
                        warn!(
                            outbox_id = %event.id,
                            event_type = %event.event_type,
                            retry_count,
                            next_retry_at = %next_retry_at,
                            "Outbox publish failed: {}", e
                        );
                        report.retrying += 1;
                        updates.push(DeliveryUpdate::Retry {
                            id: event.id,
                            retry_count,
                            next_retry_at,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        self.store.apply_batch(&updates).await?;

        debug!(
            fetched = report.fetched,
            sent = report.sent,
            retrying = report.retrying,
            permanently_failed = report.permanently_failed,
            "Outbox batch processed"
        );
        Ok(report)
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let body = serde_json::to_vec(&RelayMessage::from(event))?;
        self.publisher.publish(&event.event_type, &body, true).await
    }

    pub async fn cleanup(&self) -> Result<u64> {
        self.cleanup_at(Utc::now()).await
    }

    /// Delete sent rows older than the retention window
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::days(self.config.retention_days);
        let removed = self.store.delete_sent_before(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Cleaned up sent outbox events");
        }
        Ok(removed)
    }

    pub async fn health(&self) -> RelayHealth {
        let running = self.is_running();
        let broker_connected = self.publisher.is_connected();

        let stats = match self.store.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Outbox stats unavailable: {:#}", e);
                None
            }
        };

        let warning = match stats {
            Some(s) if s.permanently_failed > 0 => Some(format!(
                "{} outbox events permanently failed",
                s.permanently_failed
            )),
            Some(_) => None,
            None => Some("outbox statistics unavailable".to_string()),
        };

        RelayHealth {
            healthy: running && broker_connected,
            running,
            broker_connected,
            stats,
            warning,
        }
    }

    /// Poll and clean up until `shutdown` flips to true, then close the broker
    /// connection. The in-flight batch always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.process_batch().await {
                        error!("Outbox batch aborted: {:#}", e);
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!("Outbox cleanup failed: {:#}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.publisher.close().await {
            warn!("Failed to close broker connection: {}", e);
        }
        info!("Outbox relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::RecordingPublisher;
    use crate::store::InMemoryOutboxStore;
    use common::OutboxStatus;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryOutboxStore>, Arc<RecordingPublisher>, OutboxRelay) {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), RelayConfig::default());
        (store, publisher, relay)
    }

    fn event(event_type: &str, created_at: DateTime<Utc>) -> OutboxEvent {
        let mut event = OutboxEvent::new(event_type, "pred-1", json!({ "probability": 0.7 }));
        event.created_at = created_at;
        event
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::seconds(60);
        assert_eq!(backoff_delay(base, 1), Duration::seconds(60));
        assert_eq!(backoff_delay(base, 2), Duration::seconds(120));
        assert_eq!(backoff_delay(base, 3), Duration::seconds(240));
        assert_eq!(backoff_delay(base, 0), base);

        let mut previous = Duration::zero();
        for retry in 1..=MAX_BACKOFF_EXPONENT + 1 {
            let delay = backoff_delay(base, retry);
            assert!(delay > previous);
            previous = delay;
        }
        assert_eq!(backoff_delay(base, 100), backoff_delay(base, MAX_BACKOFF_EXPONENT + 1));
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let (store, publisher, relay) = setup();
        let now = Utc::now();
        let row = event("prediction.created", now - Duration::seconds(10));
        store.enqueue(row.clone()).await;

        let report = relay.process_batch_at(now).await.unwrap();
        assert_eq!(report.sent, 1);

        let stored = store.get(row.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.processed_at, Some(now));

        let messages = publisher.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].routing_key, "prediction.created");
        assert!(messages[0].persistent);

        let body = messages[0].json();
        assert_eq!(body["id"], json!(row.id));
        assert_eq!(body["event_type"], "prediction.created");
        assert_eq!(body["aggregate_id"], "pred-1");
        assert_eq!(body["payload"]["probability"], 0.7);

        // Sent rows are not picked up again
        let again = relay.process_batch_at(now + Duration::hours(1)).await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(publisher.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_permanent_failure() {
        let (store, publisher, relay) = setup();
        publisher.set_failing(true);
        let t0 = Utc::now();
        let row = event("prediction.expired", t0);
        store.enqueue(row.clone()).await;

        relay.process_batch_at(t0).await.unwrap();
        let first = store.get(row.id).await.unwrap();
        assert_eq!(first.status, OutboxStatus::Failed);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.next_retry_at, Some(t0 + Duration::seconds(60)));
        assert!(first.error_message.is_some());

        // Not due before the backoff elapses
        assert_eq!(relay.process_batch_at(t0 + Duration::seconds(30)).await.unwrap().fetched, 0);

        let t1 = t0 + Duration::seconds(61);
        relay.process_batch_at(t1).await.unwrap();
        let second = store.get(row.id).await.unwrap();
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.next_retry_at, Some(t1 + Duration::seconds(120)));
        assert!(second.next_retry_at > first.next_retry_at);

        let t2 = t1 + Duration::seconds(121);
        let report = relay.process_batch_at(t2).await.unwrap();
        assert_eq!(report.permanently_failed, 1);

        let last = store.get(row.id).await.unwrap();
        assert_eq!(last.status, OutboxStatus::Failed);
        assert_eq!(last.retry_count, 3);
        assert!(last.next_retry_at.is_none());
        assert!(last.is_permanently_failed());

        // Never retried again, even once the broker recovers
        publisher.set_failing(false);
        assert_eq!(relay.process_batch_at(t2 + Duration::days(1)).await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn test_failed_row_does_not_block_batch() {
        let (store, publisher, relay) = setup();
        publisher.fail_routing_key("poison.event").await;
        let now = Utc::now();

        let first = event("prediction.created", now - Duration::minutes(3));
        let poison = event("poison.event", now - Duration::minutes(2));
        let last = event("prediction.fulfilled", now - Duration::minutes(1));
        for row in [last.clone(), poison.clone(), first.clone()] {
            store.enqueue(row).await;
        }

        let report = relay.process_batch_at(now).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.retrying, 1);

        // Oldest first
        let keys: Vec<String> = publisher.messages().await.into_iter().map(|m| m.routing_key).collect();
        assert_eq!(keys, vec!["prediction.created", "prediction.fulfilled"]);
        assert_eq!(store.get(poison.id).await.unwrap().status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_iteration() {
        let (store, publisher, relay) = setup();
        store.enqueue(event("prediction.created", Utc::now())).await;
        store.set_unavailable(true);

        assert!(relay.process_batch_at(Utc::now()).await.is_err());
        assert!(publisher.messages().await.is_empty());

        store.set_unavailable(false);
        assert_eq!(relay.process_batch_at(Utc::now()).await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_batch_size_limit() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let config = RelayConfig {
            batch_size: 2,
            ..Default::default()
        };
        let relay = OutboxRelay::new(store.clone(), publisher.clone(), config);
        let now = Utc::now();
        for i in 0..5 {
            store.enqueue(event("prediction.created", now - Duration::seconds(10 - i))).await;
        }

        assert_eq!(relay.process_batch_at(now).await.unwrap().sent, 2);
        assert_eq!(relay.process_batch_at(now).await.unwrap().sent, 2);
        assert_eq!(relay.process_batch_at(now).await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let (store, _publisher, relay) = setup();
        let now = Utc::now();

        let mut old = event("prediction.created", now - Duration::days(10));
        old.status = OutboxStatus::Sent;
        old.processed_at = Some(now - Duration::days(8));
        let mut fresh = event("prediction.created", now - Duration::days(2));
        fresh.status = OutboxStatus::Sent;
        fresh.processed_at = Some(now - Duration::days(2));
        let pending = event("prediction.created", now - Duration::days(30));

        for row in [old.clone(), fresh.clone(), pending.clone()] {
            store.enqueue(row).await;
        }

        assert_eq!(relay.cleanup_at(now).await.unwrap(), 1);
        assert!(store.get(old.id).await.is_none());
        assert!(store.get(fresh.id).await.is_some());
        assert!(store.get(pending.id).await.is_some());
    }

    #[tokio::test]
    async fn test_health() {
        let (store, publisher, relay) = setup();

        let idle = relay.health().await;
        assert!(!idle.healthy);
        assert!(!idle.running);
        assert!(idle.broker_connected);

        relay.running.store(true, Ordering::SeqCst);
        assert!(relay.health().await.healthy);

        let mut dead = event("prediction.created", Utc::now());
        dead.status = OutboxStatus::Failed;
        dead.retry_count = dead.max_retries;
        store.enqueue(dead).await;

        let degraded = relay.health().await;
        assert!(degraded.healthy);
        assert_eq!(degraded.stats.unwrap().permanently_failed, 1);
        assert!(degraded.warning.unwrap().contains("permanently failed"));

        publisher.set_connected(false);
        let disconnected = relay.health().await;
        assert!(!disconnected.healthy);
        assert!(!disconnected.broker_connected);
    }
}
