//! Outbox table shared by every producer and by the relay.
//!
//! Producers call [`enqueue`] on the connection of their own transaction so the
//! delivery intent commits or rolls back together with the business change.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::models::{OutboxEvent, OutboxStatus};

pub const CREATE_OUTBOX_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_retry_at TIMESTAMPTZ,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ
    );

    CREATE INDEX IF NOT EXISTS idx_outbox_status_created ON outbox_events(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_outbox_next_retry ON outbox_events(next_retry_at) WHERE status = 'failed';
"#;

pub const OUTBOX_COLUMNS: &str = "id, event_type, aggregate_id, payload, status, retry_count, \
     max_retries, next_retry_at, error_message, created_at, processed_at";

/// Append a delivery intent inside the caller's transaction.
pub async fn enqueue(conn: &mut PgConnection, event: &OutboxEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (
            id, event_type, aggregate_id, payload, status,
            retry_count, max_retries, next_retry_at, error_message, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(event.id)
    .bind(&event.event_type)
    .bind(&event.aggregate_id)
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(event.retry_count)
    .bind(event.max_retries)
    .bind(event.next_retry_at)
    .bind(&event.error_message)
    .bind(event.created_at)
    .execute(conn)
    .await
    .with_context(|| format!("Failed to enqueue outbox event {}", event.event_type))?;

    Ok(())
}

/// Map a row selected with [`OUTBOX_COLUMNS`].
pub fn from_row(row: &PgRow) -> Result<OutboxEvent> {
    let status: String = row.try_get("status")?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: row.try_get("payload")?,
        status: status.parse::<OutboxStatus>()?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        next_retry_at: row.try_get("next_retry_at")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}
