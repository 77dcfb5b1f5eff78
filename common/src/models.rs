use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Retry budget given to outbox rows whose producer did not pick one.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Raised when a status column holds a value this code does not know about.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// A typed occurrence extracted from a news item by the upstream pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    /// Companies, tickers, people and metrics; shape owned by the extractor
    #[serde(default)]
    pub attrs: serde_json::Value,
    #[serde(default)]
    pub is_anchor: bool,
    pub confidence: f64,
}

impl Event {
    pub fn new(event_type: impl Into<String>, title: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            title: title.into(),
            timestamp,
            attrs: serde_json::Value::Null,
            is_anchor: false,
            confidence: 1.0,
        }
    }

    /// Tickers listed under `attrs.tickers`, in extractor order.
    pub fn tickers(&self) -> Vec<String> {
        self.attrs
            .get("tickers")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_str())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchLevel {
    /// Immediate alert
    L0,
    /// Pattern correlation
    L1,
    /// Forward prediction
    L2,
}

impl WatchLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchLevel::L0 => "L0",
            WatchLevel::L1 => "L1",
            WatchLevel::L2 => "L2",
        }
    }
}

impl FromStr for WatchLevel {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L0" => Ok(WatchLevel::L0),
            "L1" => Ok(WatchLevel::L1),
            "L2" => Ok(WatchLevel::L2),
            other => Err(ParseStatusError {
                kind: "watch level",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    Triggered,
    Notified,
    Expired,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Triggered => "triggered",
            WatchStatus::Notified => "notified",
            WatchStatus::Expired => "expired",
        }
    }
}

impl FromStr for WatchStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triggered" => Ok(WatchStatus::Triggered),
            "notified" => Ok(WatchStatus::Notified),
            "expired" => Ok(WatchStatus::Expired),
            other => Err(ParseStatusError {
                kind: "watch status",
                value: other.to_string(),
            }),
        }
    }
}

/// A monitoring rule firing against an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredWatch {
    pub id: Uuid,
    pub rule_id: String,
    pub rule_name: String,
    pub watch_level: WatchLevel,
    pub event_id: Uuid,
    pub trigger_time: DateTime<Utc>,
    pub auto_expire_at: Option<DateTime<Utc>>,
    pub status: WatchStatus,
    #[serde(default)]
    pub context: serde_json::Value,
    pub notifications_sent: i32,
}

impl TriggeredWatch {
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.auto_expire_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Pending,
    Fulfilled,
    Expired,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "pending",
            PredictionStatus::Fulfilled => "fulfilled",
            PredictionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PredictionStatus::Pending)
    }
}

impl fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PredictionStatus::Pending),
            "fulfilled" => Ok(PredictionStatus::Fulfilled),
            "expired" => Ok(PredictionStatus::Expired),
            other => Err(ParseStatusError {
                kind: "prediction status",
                value: other.to_string(),
            }),
        }
    }
}

/// A forecast that some follow-on event will happen within a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPrediction {
    pub id: Uuid,
    pub watch_id: Uuid,
    pub base_event_id: Uuid,
    pub predicted_event_type: String,
    pub prediction_probability: f64,
    pub prediction_window_days: i64,
    pub target_date_estimate: DateTime<Utc>,
    pub status: PredictionStatus,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub actual_event_id: Option<Uuid>,
    /// Provenance for audit and debugging, never read for control flow
    pub prediction_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(ParseStatusError {
                kind: "outbox status",
                value: other.to_string(),
            }),
        }
    }
}

/// A durable intent to deliver a domain event to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Failed with no retry budget left. Operators have to step in.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == OutboxStatus::Failed && self.retry_count >= self.max_retries
    }

    /// Whether the relay should pick this row up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Sent => false,
            OutboxStatus::Failed => {
                self.retry_count < self.max_retries
                    && self.next_retry_at.map_or(true, |at| at <= now)
            }
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}
