//! Shared domain types for the event intelligence workspace.
//!
//! Every crate in the workspace speaks in terms of these records: events read from
//! the ingestion pipeline, watches fired by the rule engine, predictions derived
//! from them, and outbox rows waiting for delivery.

pub mod models;
pub mod outbox;
pub mod telemetry;

pub use models::{
    Event, EventPrediction, OutboxEvent, OutboxStatus, ParseStatusError, PredictionStatus,
    TriggeredWatch, WatchLevel, WatchStatus, DEFAULT_MAX_RETRIES,
};

pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
