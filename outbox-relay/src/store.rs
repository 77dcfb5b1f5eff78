use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{outbox, OutboxEvent, OutboxStatus};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of one publish attempt, written back in the batch commit
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryUpdate {
    Sent {
        id: Uuid,
        processed_at: DateTime<Utc>,
    },
    Retry {
        id: Uuid,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    PermanentlyFailed {
        id: Uuid,
        retry_count: i32,
        error: String,
    },
}

impl DeliveryUpdate {
    pub fn id(&self) -> Uuid {
        match self {
            DeliveryUpdate::Sent { id, .. }
            | DeliveryUpdate::Retry { id, .. }
            | DeliveryUpdate::PermanentlyFailed { id, .. } => *id,
        }
    }

    fn apply_to(&self, event: &mut OutboxEvent) {
        match self {
            DeliveryUpdate::Sent { processed_at, .. } => {
                event.status = OutboxStatus::Sent;
                event.processed_at = Some(*processed_at);
                event.next_retry_at = None;
                event.error_message = None;
            }
            DeliveryUpdate::Retry {
                retry_count,
                next_retry_at,
                error,
                ..
            } => {
                event.status = OutboxStatus::Failed;
                event.retry_count = *retry_count;
                event.next_retry_at = Some(*next_retry_at);
                event.error_message = Some(error.clone());
            }
            DeliveryUpdate::PermanentlyFailed {
                retry_count, error, ..
            } => {
                event.status = OutboxStatus::Failed;
                event.retry_count = *retry_count;
                event.next_retry_at = None;
                event.error_message = Some(error.clone());
            }
        }
    }
}

/// Row counts by delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: i64,
    pub sent: i64,
    /// Failed with retry budget left
    pub retrying: i64,
    pub permanently_failed: i64,
}

impl OutboxStats {
    pub fn total(&self) -> i64 {
        self.pending + self.sent + self.retrying + self.permanently_failed
    }
}

/// Persistence used by the relay. The relay is the only writer of delivery state.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending rows plus failed rows whose retry is due, oldest first
    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEvent>>;

    /// Write all updates in one transaction. Rows already `sent` are left untouched.
    async fn apply_batch(&self, updates: &[DeliveryUpdate]) -> Result<()>;

    /// Delete `sent` rows processed before `cutoff`; returns the number removed
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self) -> Result<OutboxStats>;
}

/// Postgres outbox table
pub struct PgOutboxStore {
    db_pool: Arc<PgPool>,
}

impl PgOutboxStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(outbox::CREATE_OUTBOX_TABLE)
            .execute(self.db_pool.as_ref())
            .await
            .context("Failed to create outbox table")?;

        info!("Outbox table initialized");
        Ok(())
    }

    /// Append one row in its own transaction
    pub async fn enqueue(&self, event: &OutboxEvent) -> Result<()> {
        let mut tx = self.db_pool.begin().await?;
        outbox::enqueue(&mut tx, event).await?;
        tx.commit().await.context("Failed to commit outbox insert")?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM outbox_events
            WHERE status = 'pending'
               OR (status = 'failed'
                   AND retry_count < max_retries
                   AND (next_retry_at IS NULL OR next_retry_at <= $1))
            ORDER BY created_at
            LIMIT $2
            "#,
            outbox::OUTBOX_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.db_pool.as_ref())
        .await
        .context("Failed to fetch due outbox events")?;

        rows.iter().map(outbox::from_row).collect()
    }

    async fn apply_batch(&self, updates: &[DeliveryUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.db_pool.begin().await?;

        for update in updates {
            let query = match update {
                DeliveryUpdate::Sent { id, processed_at } => sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET status = 'sent', processed_at = $2, next_retry_at = NULL, error_message = NULL
                    WHERE id = $1 AND status <> 'sent'
                    "#,
                )
                .bind(*id)
                .bind(*processed_at),
                DeliveryUpdate::Retry {
                    id,
                    retry_count,
                    next_retry_at,
                    error,
                } => sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET status = 'failed', retry_count = $2, next_retry_at = $3, error_message = $4
                    WHERE id = $1 AND status <> 'sent'
                    "#,
                )
                .bind(*id)
                .bind(*retry_count)
                .bind(*next_retry_at)
                .bind(error.as_str()),
                DeliveryUpdate::PermanentlyFailed {
                    id,
                    retry_count,
                    error,
                } => sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET status = 'failed', retry_count = $2, next_retry_at = NULL, error_message = $3
                    WHERE id = $1 AND status <> 'sent'
                    "#,
                )
                .bind(*id)
                .bind(*retry_count)
                .bind(error.as_str()),
            };

            query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to update outbox event {}", update.id()))?;
        }

        tx.commit().await.context("Failed to commit outbox batch")?;
        debug!(updates = updates.len(), "Outbox batch committed");
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE status = 'sent' AND COALESCE(processed_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(self.db_pool.as_ref())
        .await
        .context("Failed to delete sent outbox events")?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed' AND retry_count < max_retries) AS retrying,
                COUNT(*) FILTER (WHERE status = 'failed' AND retry_count >= max_retries) AS permanently_failed
            FROM outbox_events
            "#,
        )
        .fetch_one(self.db_pool.as_ref())
        .await
        .context("Failed to fetch outbox stats")?;

        Ok(OutboxStats {
            pending: row.try_get("pending")?,
            sent: row.try_get("sent")?,
            retrying: row.try_get("retrying")?,
            permanently_failed: row.try_get("permanently_failed")?,
        })
    }
}

/// In-memory outbox (for testing and development)
#[derive(Default)]
pub struct InMemoryOutboxStore {
    events: RwLock<Vec<OutboxEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, event: OutboxEvent) {
        self.events.write().await.push(event);
    }

    pub async fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        self.events.read().await.iter().find(|e| e.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<OutboxEvent> {
        self.events.read().await.clone()
    }

    /// Simulate a database outage: every call fails until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("outbox store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEvent>> {
        self.check_available()?;
        let events = self.events.read().await;
        let mut due: Vec<OutboxEvent> = events.iter().filter(|e| e.is_due(now)).cloned().collect();
        due.sort_by_key(|e| e.created_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn apply_batch(&self, updates: &[DeliveryUpdate]) -> Result<()> {
        self.check_available()?;
        let mut events = self.events.write().await;

        for update in updates {
            if let Some(event) = events.iter_mut().find(|e| e.id == update.id()) {
                if event.status != OutboxStatus::Sent {
                    update.apply_to(event);
                }
            }
        }
        Ok(())
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| {
            !(e.status == OutboxStatus::Sent && e.processed_at.unwrap_or(e.created_at) < cutoff)
        });
        Ok((before - events.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        self.check_available()?;
        let events = self.events.read().await;
        let mut stats = OutboxStats::default();
        for event in events.iter() {
            match event.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Failed if event.is_permanently_failed() => stats.permanently_failed += 1,
                OutboxStatus::Failed => stats.retrying += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event_at(event_type: &str, created_at: DateTime<Utc>) -> OutboxEvent {
        let mut event = OutboxEvent::new(event_type, "agg-1", json!({}));
        event.created_at = created_at;
        event
    }

    #[tokio::test]
    async fn test_fetch_due_order_and_limit() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let newest = event_at("b", now - Duration::minutes(1));
        let oldest = event_at("a", now - Duration::minutes(10));
        let middle = event_at("c", now - Duration::minutes(5));
        for e in [newest, oldest.clone(), middle.clone()] {
            store.enqueue(e).await;
        }

        let due = store.fetch_due(now, 2).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![oldest.id, middle.id]);
    }

    #[tokio::test]
    async fn test_sent_rows_never_rewritten() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        let event = event_at("a", now);
        store.enqueue(event.clone()).await;

        store
            .apply_batch(&[DeliveryUpdate::Sent {
                id: event.id,
                processed_at: now,
            }])
            .await
            .unwrap();
        store
            .apply_batch(&[DeliveryUpdate::Retry {
                id: event.id,
                retry_count: 1,
                next_retry_at: now,
                error: "late failure".to_string(),
            }])
            .await
            .unwrap();

        let stored = store.get(event.id).await.unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        let mut old_sent = event_at("a", now - Duration::days(9));
        old_sent.status = OutboxStatus::Sent;
        old_sent.processed_at = Some(now - Duration::days(8));
        let mut recent_sent = event_at("a", now - Duration::days(3));
        recent_sent.status = OutboxStatus::Sent;
        recent_sent.processed_at = Some(now - Duration::days(2));
        let mut retrying = event_at("b", now - Duration::days(10));
        retrying.status = OutboxStatus::Failed;
        retrying.retry_count = 1;
        let mut dead = event_at("c", now - Duration::days(10));
        dead.status = OutboxStatus::Failed;
        dead.retry_count = 3;
        let pending = event_at("d", now - Duration::days(10));

        for e in [old_sent, recent_sent, retrying, dead, pending] {
            store.enqueue(e).await;
        }

        assert_eq!(
            store.stats().await.unwrap(),
            OutboxStats {
                pending: 1,
                sent: 2,
                retrying: 1,
                permanently_failed: 1,
            }
        );

        let removed = store.delete_sent_before(now - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().await.unwrap().total(), 4);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryOutboxStore::new();
        store.set_unavailable(true);
        assert!(store.fetch_due(Utc::now(), 10).await.is_err());
        assert!(store.stats().await.is_err());
        store.set_unavailable(false);
        assert!(store.fetch_due(Utc::now(), 10).await.unwrap().is_empty());
    }
}
