use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{outbox, Event, EventPrediction, OutboxEvent, TriggeredWatch, WatchLevel};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{PredictionStore, PredictionTransition, TypeStatusCounts};

const EVENT_COLUMNS: &str = "id, event_type, title, timestamp, attrs, is_anchor, confidence";

const WATCH_COLUMNS: &str = "id, rule_id, rule_name, watch_level, event_id, trigger_time, \
     auto_expire_at, status, context, notifications_sent";

const PREDICTION_COLUMNS: &str = "id, watch_id, base_event_id, predicted_event_type, \
     prediction_probability, prediction_window_days, target_date_estimate, status, \
     fulfilled_at, actual_event_id, prediction_context, created_at";

fn event_from_row(row: &PgRow) -> Result<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        title: row.try_get("title")?,
        timestamp: row.try_get("timestamp")?,
        attrs: row.try_get("attrs")?,
        is_anchor: row.try_get("is_anchor")?,
        confidence: row.try_get("confidence")?,
    })
}

fn watch_from_row(row: &PgRow) -> Result<TriggeredWatch> {
    let level: String = row.try_get("watch_level")?;
    let status: String = row.try_get("status")?;

    Ok(TriggeredWatch {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        rule_name: row.try_get("rule_name")?,
        watch_level: level.parse()?,
        event_id: row.try_get("event_id")?,
        trigger_time: row.try_get("trigger_time")?,
        auto_expire_at: row.try_get("auto_expire_at")?,
        status: status.parse()?,
        context: row.try_get("context")?,
        notifications_sent: row.try_get("notifications_sent")?,
    })
}

fn prediction_from_row(row: &PgRow) -> Result<EventPrediction> {
    let status: String = row.try_get("status")?;

    Ok(EventPrediction {
        id: row.try_get("id")?,
        watch_id: row.try_get("watch_id")?,
        base_event_id: row.try_get("base_event_id")?,
        predicted_event_type: row.try_get("predicted_event_type")?,
        prediction_probability: row.try_get("prediction_probability")?,
        prediction_window_days: row.try_get("prediction_window_days")?,
        target_date_estimate: row.try_get("target_date_estimate")?,
        status: status.parse()?,
        fulfilled_at: row.try_get("fulfilled_at")?,
        actual_event_id: row.try_get("actual_event_id")?,
        prediction_context: row.try_get("prediction_context")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres-backed prediction store
pub struct PgPredictionStore {
    db_pool: Arc<PgPool>,
}

impl PgPredictionStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    /// Initialize the prediction tables
    pub async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id UUID PRIMARY KEY,
                event_type TEXT NOT NULL,
                title TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                attrs JSONB NOT NULL DEFAULT '{}'::jsonb,
                is_anchor BOOLEAN NOT NULL DEFAULT FALSE,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 1.0,
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_events_type_time ON events(event_type, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);

            CREATE TABLE IF NOT EXISTS event_importance (
                event_id UUID PRIMARY KEY REFERENCES events(id),
                importance_score DOUBLE PRECISION NOT NULL,
                components_details JSONB,
                updated_at TIMESTAMPTZ DEFAULT NOW()
            );

            CREATE TABLE IF NOT EXISTS triggered_watches (
                id UUID PRIMARY KEY,
                rule_id TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                watch_level TEXT NOT NULL,
                event_id UUID NOT NULL REFERENCES events(id),
                trigger_time TIMESTAMPTZ NOT NULL,
                auto_expire_at TIMESTAMPTZ,
                status TEXT NOT NULL DEFAULT 'triggered',
                context JSONB NOT NULL DEFAULT '{}'::jsonb,
                notifications_sent INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_watches_level_status ON triggered_watches(watch_level, status);

            CREATE TABLE IF NOT EXISTS event_predictions (
                id UUID PRIMARY KEY,
                watch_id UUID NOT NULL REFERENCES triggered_watches(id),
                base_event_id UUID NOT NULL REFERENCES events(id),
                predicted_event_type TEXT NOT NULL,
                prediction_probability DOUBLE PRECISION NOT NULL
                    CHECK (prediction_probability >= 0 AND prediction_probability <= 0.95),
                prediction_window_days BIGINT NOT NULL,
                target_date_estimate TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                fulfilled_at TIMESTAMPTZ,
                actual_event_id UUID REFERENCES events(id),
                prediction_context JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_predictions_status_created ON event_predictions(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_predictions_type ON event_predictions(predicted_event_type);
            "#,
        )
        .execute(self.db_pool.as_ref())
        .await
        .context("Failed to create prediction tables")?;

        sqlx::raw_sql(outbox::CREATE_OUTBOX_TABLE)
            .execute(self.db_pool.as_ref())
            .await
            .context("Failed to create outbox table")?;

        info!("Prediction tables initialized");
        Ok(())
    }
}

#[async_trait]
impl PredictionStore for PgPredictionStore {
    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query(&format!("SELECT {} FROM events WHERE id = $1", EVENT_COLUMNS))
            .bind(event_id)
            .fetch_optional(self.db_pool.as_ref())
            .await
            .context("Failed to fetch event")?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn events_of_type_between(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE event_type = $1 AND timestamp >= $2 AND timestamp < $3
            ORDER BY timestamp DESC
            LIMIT $4
            "#,
            EVENT_COLUMNS
        ))
        .bind(event_type)
        .bind(from)
        .bind(to)
        .bind(limit as i64)
        .fetch_all(self.db_pool.as_ref())
        .await
        .context("Failed to fetch events by type")?;

        rows.iter().map(event_from_row).collect()
    }

    async fn events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM events
            WHERE timestamp >= $1 AND timestamp <= $2
            ORDER BY timestamp ASC
            "#,
            EVENT_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(self.db_pool.as_ref())
        .await
        .context("Failed to fetch events in range")?;

        rows.iter().map(event_from_row).collect()
    }

    async fn importance_score(&self, event_id: Uuid) -> Result<Option<f64>> {
        let score = sqlx::query_scalar::<_, f64>(
            "SELECT importance_score FROM event_importance WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(self.db_pool.as_ref())
        .await
        .context("Failed to fetch importance score")?;

        Ok(score)
    }

    async fn triggered_watches(&self, level: WatchLevel, limit: i64) -> Result<Vec<TriggeredWatch>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM triggered_watches
            WHERE watch_level = $1 AND status = 'triggered'
            ORDER BY trigger_time ASC
            LIMIT $2
            "#,
            WATCH_COLUMNS
        ))
        .bind(level.as_str())
        .bind(limit)
        .fetch_all(self.db_pool.as_ref())
        .await
        .context("Failed to fetch triggered watches")?;

        rows.iter().map(watch_from_row).collect()
    }

    async fn expire_watch(&self, watch_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE triggered_watches SET status = 'expired' WHERE id = $1 AND status = 'triggered'",
        )
        .bind(watch_id)
        .execute(self.db_pool.as_ref())
        .await
        .context("Failed to expire watch")?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_generated(
        &self,
        watch_id: Uuid,
        predictions: &[EventPrediction],
        outbox_events: &[OutboxEvent],
    ) -> Result<bool> {
        let mut tx = self
            .db_pool
            .begin()
            .await
            .context("Failed to open prediction transaction")?;

        let claimed = sqlx::query(
            r#"
            UPDATE triggered_watches
            SET status = 'notified',
                notifications_sent = notifications_sent + 1
            WHERE id = $1 AND status = 'triggered'
            "#,
        )
        .bind(watch_id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark watch notified")?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Watch {} already processed", watch_id);
            return Ok(false);
        }

        for prediction in predictions {
            sqlx::query(
                r#"
                INSERT INTO event_predictions (
                    id, watch_id, base_event_id, predicted_event_type,
                    prediction_probability, prediction_window_days, target_date_estimate,
                    status, prediction_context, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(prediction.id)
            .bind(prediction.watch_id)
            .bind(prediction.base_event_id)
            .bind(&prediction.predicted_event_type)
            .bind(prediction.prediction_probability)
            .bind(prediction.prediction_window_days)
            .bind(prediction.target_date_estimate)
            .bind(prediction.status.as_str())
            .bind(&prediction.prediction_context)
            .bind(prediction.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to store prediction")?;
        }

        for event in outbox_events {
            outbox::enqueue(&mut tx, event).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit prediction batch")?;
        Ok(true)
    }

    async fn get_prediction(&self, prediction_id: Uuid) -> Result<Option<EventPrediction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM event_predictions WHERE id = $1",
            PREDICTION_COLUMNS
        ))
        .bind(prediction_id)
        .fetch_optional(self.db_pool.as_ref())
        .await
        .context("Failed to fetch prediction")?;

        row.as_ref().map(prediction_from_row).transpose()
    }

    async fn pending_predictions(&self, created_before: DateTime<Utc>) -> Result<Vec<EventPrediction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM event_predictions
            WHERE status = 'pending' AND created_at <= $1
            ORDER BY created_at ASC
            "#,
            PREDICTION_COLUMNS
        ))
        .bind(created_before)
        .fetch_all(self.db_pool.as_ref())
        .await
        .context("Failed to fetch pending predictions")?;

        rows.iter().map(prediction_from_row).collect()
    }

    async fn transition(
        &self,
        prediction_id: Uuid,
        transition: PredictionTransition,
        outbox_event: &OutboxEvent,
    ) -> Result<bool> {
        let (actual_event_id, fulfilled_at) = match &transition {
            PredictionTransition::Fulfilled {
                actual_event_id,
                fulfilled_at,
            } => (Some(*actual_event_id), Some(*fulfilled_at)),
            PredictionTransition::Expired => (None, None),
        };

        let mut tx = self
            .db_pool
            .begin()
            .await
            .context("Failed to open transition transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE event_predictions
            SET status = $2,
                actual_event_id = $3,
                fulfilled_at = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(prediction_id)
        .bind(transition.status().as_str())
        .bind(actual_event_id)
        .bind(fulfilled_at)
        .execute(&mut *tx)
        .await
        .context("Failed to update prediction status")?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        outbox::enqueue(&mut tx, outbox_event).await?;
        tx.commit()
            .await
            .context("Failed to commit prediction transition")?;
        Ok(true)
    }

    async fn status_counts(&self) -> Result<Vec<TypeStatusCounts>> {
        let rows = sqlx::query_as::<_, (String, i64, i64, i64)>(
            r#"
            SELECT
                predicted_event_type,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'fulfilled') AS fulfilled,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired
            FROM event_predictions
            GROUP BY predicted_event_type
            ORDER BY predicted_event_type
            "#,
        )
        .fetch_all(self.db_pool.as_ref())
        .await
        .context("Failed to count predictions")?;

        Ok(rows
            .into_iter()
            .map(|(predicted_event_type, pending, fulfilled, expired)| TypeStatusCounts {
                predicted_event_type,
                pending,
                fulfilled,
                expired,
            })
            .collect())
    }
}
