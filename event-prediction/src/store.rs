// Prediction storage interface
// Reads events and watches, persists predictions together with their outbox rows

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use common::{
    Event, EventPrediction, OutboxEvent, PredictionStatus, TriggeredWatch, WatchLevel, WatchStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Terminal move of a pending prediction
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionTransition {
    Fulfilled {
        actual_event_id: Uuid,
        fulfilled_at: DateTime<Utc>,
    },
    Expired,
}

impl PredictionTransition {
    pub fn status(&self) -> PredictionStatus {
        match self {
            PredictionTransition::Fulfilled { .. } => PredictionStatus::Fulfilled,
            PredictionTransition::Expired => PredictionStatus::Expired,
        }
    }
}

/// Stored prediction counts for one predicted type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStatusCounts {
    pub predicted_event_type: String,
    pub pending: i64,
    pub fulfilled: i64,
    pub expired: i64,
}

/// Storage backend for the prediction engine.
///
/// Every write method is one transaction: predictions, watch bookkeeping and
/// the matching outbox rows commit together or not at all.
#[async_trait::async_trait]
pub trait PredictionStore: Send + Sync {
    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>>;

    /// Events of one type with `from <= timestamp < to`, newest first
    async fn events_of_type_between(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Events with `from <= timestamp <= to`, oldest first
    async fn events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>>;

    async fn importance_score(&self, event_id: Uuid) -> Result<Option<f64>>;

    /// Watches still in `triggered` state at the given level, oldest first
    async fn triggered_watches(&self, level: WatchLevel, limit: i64) -> Result<Vec<TriggeredWatch>>;

    /// Mark a triggered watch expired. Returns false if it was no longer triggered.
    async fn expire_watch(&self, watch_id: Uuid) -> Result<bool>;

    /// Mark the watch notified and persist its predictions and outbox rows.
    /// Returns false, writing nothing, if the watch was no longer triggered.
    async fn save_generated(
        &self,
        watch_id: Uuid,
        predictions: &[EventPrediction],
        outbox: &[OutboxEvent],
    ) -> Result<bool>;

    async fn get_prediction(&self, prediction_id: Uuid) -> Result<Option<EventPrediction>>;

    /// Pending predictions created at or before `created_before`, oldest first
    async fn pending_predictions(&self, created_before: DateTime<Utc>) -> Result<Vec<EventPrediction>>;

    /// Compare-and-set from `pending`. Returns false, writing nothing, if the
    /// prediction had already left `pending`.
    async fn transition(
        &self,
        prediction_id: Uuid,
        transition: PredictionTransition,
        outbox: &OutboxEvent,
    ) -> Result<bool>;

    async fn status_counts(&self) -> Result<Vec<TypeStatusCounts>>;
}

#[derive(Default)]
struct InMemoryState {
    events: HashMap<Uuid, Event>,
    importance: HashMap<Uuid, f64>,
    watches: HashMap<Uuid, TriggeredWatch>,
    predictions: HashMap<Uuid, EventPrediction>,
    outbox: Vec<OutboxEvent>,
}

/// In-memory store (for testing and development)
#[derive(Default)]
pub struct InMemoryPredictionStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryPredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: Event) {
        self.state.write().await.events.insert(event.id, event);
    }

    pub async fn insert_watch(&self, watch: TriggeredWatch) {
        self.state.write().await.watches.insert(watch.id, watch);
    }

    pub async fn insert_prediction(&self, prediction: EventPrediction) {
        self.state
            .write()
            .await
            .predictions
            .insert(prediction.id, prediction);
    }

    pub async fn set_importance(&self, event_id: Uuid, score: f64) {
        self.state.write().await.importance.insert(event_id, score);
    }

    pub async fn get_watch(&self, watch_id: Uuid) -> Option<TriggeredWatch> {
        self.state.read().await.watches.get(&watch_id).cloned()
    }

    /// Outbox rows written so far, in insertion order
    pub async fn outbox(&self) -> Vec<OutboxEvent> {
        self.state.read().await.outbox.clone()
    }

    pub async fn predictions(&self) -> Vec<EventPrediction> {
        let mut all: Vec<_> = self.state.read().await.predictions.values().cloned().collect();
        all.sort_by_key(|p| p.created_at);
        all
    }
}

#[async_trait::async_trait]
impl PredictionStore for InMemoryPredictionStore {
    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>> {
        Ok(self.state.read().await.events.get(&event_id).cloned())
    }

    async fn events_of_type_between(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.event_type == event_type && e.timestamp >= from && e.timestamp < to)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn importance_score(&self, event_id: Uuid) -> Result<Option<f64>> {
        Ok(self.state.read().await.importance.get(&event_id).copied())
    }

    async fn triggered_watches(&self, level: WatchLevel, limit: i64) -> Result<Vec<TriggeredWatch>> {
        let state = self.state.read().await;
        let mut watches: Vec<TriggeredWatch> = state
            .watches
            .values()
            .filter(|w| w.watch_level == level && w.status == WatchStatus::Triggered)
            .cloned()
            .collect();
        watches.sort_by_key(|w| w.trigger_time);
        watches.truncate(limit.max(0) as usize);
        Ok(watches)
    }

    async fn expire_watch(&self, watch_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.watches.get_mut(&watch_id) {
            Some(watch) if watch.status == WatchStatus::Triggered => {
                watch.status = WatchStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_generated(
        &self,
        watch_id: Uuid,
        predictions: &[EventPrediction],
        outbox: &[OutboxEvent],
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let watch = state
            .watches
            .get_mut(&watch_id)
            .ok_or_else(|| anyhow!("Watch {} not found", watch_id))?;
        if watch.status != WatchStatus::Triggered {
            return Ok(false);
        }
        watch.status = WatchStatus::Notified;
        watch.notifications_sent += 1;

        for prediction in predictions {
            state.predictions.insert(prediction.id, prediction.clone());
        }
        state.outbox.extend(outbox.iter().cloned());
        Ok(true)
    }

    async fn get_prediction(&self, prediction_id: Uuid) -> Result<Option<EventPrediction>> {
        Ok(self.state.read().await.predictions.get(&prediction_id).cloned())
    }

    async fn pending_predictions(&self, created_before: DateTime<Utc>) -> Result<Vec<EventPrediction>> {
        let state = self.state.read().await;
        let mut pending: Vec<EventPrediction> = state
            .predictions
            .values()
            .filter(|p| p.status == PredictionStatus::Pending && p.created_at <= created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        Ok(pending)
    }

    async fn transition(
        &self,
        prediction_id: Uuid,
        transition: PredictionTransition,
        outbox: &OutboxEvent,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let prediction = state
            .predictions
            .get_mut(&prediction_id)
            .ok_or_else(|| anyhow!("Prediction {} not found", prediction_id))?;
        if prediction.status != PredictionStatus::Pending {
            return Ok(false);
        }

        prediction.status = transition.status();
        if let PredictionTransition::Fulfilled {
            actual_event_id,
            fulfilled_at,
        } = transition
        {
            prediction.actual_event_id = Some(actual_event_id);
            prediction.fulfilled_at = Some(fulfilled_at);
        }
        state.outbox.push(outbox.clone());
        Ok(true)
    }

    async fn status_counts(&self) -> Result<Vec<TypeStatusCounts>> {
        let state = self.state.read().await;
        let mut counts: HashMap<String, TypeStatusCounts> = HashMap::new();
        for prediction in state.predictions.values() {
            let entry = counts
                .entry(prediction.predicted_event_type.clone())
                .or_insert_with(|| TypeStatusCounts {
                    predicted_event_type: prediction.predicted_event_type.clone(),
                    ..Default::default()
                });
            match prediction.status {
                PredictionStatus::Pending => entry.pending += 1,
                PredictionStatus::Fulfilled => entry.fulfilled += 1,
                PredictionStatus::Expired => entry.expired += 1,
            }
        }
        let mut counts: Vec<_> = counts.into_values().collect();
        counts.sort_by(|a, b| a.predicted_event_type.cmp(&b.predicted_event_type));
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn prediction(created_at: DateTime<Utc>) -> EventPrediction {
        EventPrediction {
            id: Uuid::new_v4(),
            watch_id: Uuid::new_v4(),
            base_event_id: Uuid::new_v4(),
            predicted_event_type: "rate_cut".to_string(),
            prediction_probability: 0.6,
            prediction_window_days: 7,
            target_date_estimate: created_at + Duration::days(7),
            status: PredictionStatus::Pending,
            fulfilled_at: None,
            actual_event_id: None,
            prediction_context: serde_json::Value::Null,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryPredictionStore::new();
        let now = Utc::now();
        let p = prediction(now);
        store.insert_prediction(p.clone()).await;

        let first_event = Uuid::new_v4();
        let fulfilled = PredictionTransition::Fulfilled {
            actual_event_id: first_event,
            fulfilled_at: now,
        };
        let message = OutboxEvent::new("prediction.fulfilled", p.id.to_string(), json!({}));
        assert!(store.transition(p.id, fulfilled, &message).await.unwrap());
        assert_eq!(store.outbox().await.len(), 1);

        // Already terminal: neither a second fulfillment nor an expiry applies
        let again = PredictionTransition::Fulfilled {
            actual_event_id: Uuid::new_v4(),
            fulfilled_at: now + Duration::hours(1),
        };
        let message = OutboxEvent::new("prediction.fulfilled", p.id.to_string(), json!({}));
        assert!(!store.transition(p.id, again, &message).await.unwrap());

        let message = OutboxEvent::new("prediction.expired", p.id.to_string(), json!({}));
        assert!(!store
            .transition(p.id, PredictionTransition::Expired, &message)
            .await
            .unwrap());

        let stored = store.get_prediction(p.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PredictionStatus::Fulfilled);
        assert_eq!(stored.actual_event_id, Some(first_event));
        assert_eq!(stored.fulfilled_at, Some(now));
        assert_eq!(store.outbox().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_unknown_prediction_errors() {
        let store = InMemoryPredictionStore::new();
        let message = OutboxEvent::new("prediction.expired", "missing", json!({}));
        assert!(store
            .transition(Uuid::new_v4(), PredictionTransition::Expired, &message)
            .await
            .is_err());
    }
}
