use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use common::{Event, EventPrediction, OutboxEvent, PredictionStatus, TriggeredWatch, WatchLevel};
use market_impact::MarketImpactAnalyzer;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accuracy::AccuracyReport;
use crate::config::{PredictedOutcome, PredictionConfig, PredictionRule};
use crate::graph::{GraphContext, GraphContextProvider};
use crate::patterns::{historical_patterns, HistoricalPatterns};
use crate::rules::{is_market_related, AliasTable, RuleTable};
use crate::store::{PredictionStore, PredictionTransition};

pub const PREDICTION_CREATED: &str = "prediction.created";
pub const PREDICTION_FULFILLED: &str = "prediction.fulfilled";
pub const PREDICTION_EXPIRED: &str = "prediction.expired";

/// Upper bound on any generated probability
pub const MAX_PROBABILITY: f64 = 0.95;

/// Context adjustment applied to a rule's base probability, in `[0.5, 2.0]`.
///
/// Unknown or non-finite inputs contribute nothing.
pub fn probability_multiplier(
    importance: Option<f64>,
    price_impact: Option<f64>,
    connected_events: usize,
) -> f64 {
    let mut multiplier = 1.0;
    if let Some(importance) = importance.filter(|v| v.is_finite()) {
        multiplier += 0.5 * (importance - 0.5);
    }
    if let Some(impact) = price_impact.filter(|v| v.is_finite()) {
        multiplier += 0.3 * impact;
    }
    multiplier += 0.2 * (connected_events as f64 / 5.0).min(1.0);
    multiplier.clamp(0.5, 2.0)
}

pub fn adjusted_probability(base_probability: f64, multiplier: f64) -> f64 {
    (base_probability * multiplier).clamp(0.0, MAX_PROBABILITY)
}

/// Result of one pass over triggered L2 watches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchPassReport {
    pub examined: usize,
    pub processed: usize,
    pub expired: usize,
    /// Watches closed because their base event no longer exists
    pub skipped: usize,
    pub predictions_created: usize,
    pub errors: usize,
}

/// Result of one fulfillment/expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub fulfilled: usize,
    pub expired: usize,
    pub still_pending: usize,
    /// Predictions another worker moved out of `pending` first
    pub conflicts: usize,
    pub errors: usize,
}

enum Generation {
    Created(Vec<EventPrediction>),
    MissingBaseEvent,
}

enum SweepOutcome {
    Fulfilled,
    Expired,
    StillPending,
    Conflict,
}

/// Turns L2 watches into forward predictions and later settles them.
pub struct EventPredictionEngine {
    store: Arc<dyn PredictionStore>,
    graph: Option<Arc<dyn GraphContextProvider>>,
    analyzer: Option<Arc<MarketImpactAnalyzer>>,
    rules: RuleTable,
    aliases: AliasTable,
    config: PredictionConfig,
}

impl EventPredictionEngine {
    pub fn new(store: Arc<dyn PredictionStore>, config: PredictionConfig) -> Self {
        Self {
            store,
            graph: None,
            analyzer: None,
            rules: RuleTable::new(config.rules.clone()),
            aliases: AliasTable::new(&config.category_aliases),
            config,
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphContextProvider>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_market_impact(mut self, analyzer: Arc<MarketImpactAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Generate and persist predictions for one watch. `families` restricts
    /// the rule families considered; `None` means all of them.
    pub async fn generate_for_watch(
        &self,
        watch: &TriggeredWatch,
        families: Option<&[String]>,
    ) -> Result<Vec<EventPrediction>> {
        self.generate_at(watch, families, Utc::now()).await
    }

    pub async fn generate_at(
        &self,
        watch: &TriggeredWatch,
        families: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventPrediction>> {
        match self.generate(watch, families, now).await? {
            Generation::Created(predictions) => Ok(predictions),
            Generation::MissingBaseEvent => Ok(Vec::new()),
        }
    }

    /// A watch whose base event is gone is expired so it never occupies a
    /// slot in later watch passes.
    async fn generate(
        &self,
        watch: &TriggeredWatch,
        families: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Generation> {
        if watch.watch_level != WatchLevel::L2 {
            debug!(watch_id = %watch.id, level = watch.watch_level.as_str(), "Not a prediction watch");
            return Ok(Generation::Created(Vec::new()));
        }

        let Some(base_event) = self.store.get_event(watch.event_id).await? else {
            warn!(
                watch_id = %watch.id,
                event_id = %watch.event_id,
                "Base event not found, expiring watch"
            );
            self.store.expire_watch(watch.id).await?;
            return Ok(Generation::MissingBaseEvent);
        };

        let matched = self.rules.matching(&base_event.event_type, families);

        let mut predictions = Vec::new();
        if !matched.is_empty() {
            let patterns =
                historical_patterns(self.store.as_ref(), &base_event, &self.config).await?;
            let graph = self.ceg_context(base_event.id).await;
            let importance = self.store.importance_score(base_event.id).await?;

            let wants_price_impact = matched.iter().any(|rule| {
                rule.outcomes
                    .iter()
                    .any(|o| is_market_related(&o.event_type, &self.config.market_keywords))
            });
            let price_impact = if wants_price_impact {
                self.price_impact(&base_event).await
            } else {
                None
            };

            for rule in matched {
                for outcome in &rule.outcomes {
                    let impact = price_impact
                        .filter(|_| is_market_related(&outcome.event_type, &self.config.market_keywords));
                    let multiplier =
                        probability_multiplier(importance, impact, graph.connected_events);

                    predictions.push(self.build_prediction(
                        watch,
                        &base_event,
                        rule,
                        outcome,
                        &patterns,
                        &graph,
                        PredictionInputs {
                            importance,
                            price_impact: impact,
                            multiplier,
                        },
                        now,
                    ));
                }
            }
        }

        let outbox: Vec<OutboxEvent> = predictions.iter().map(created_message).collect();

        if !self.store.save_generated(watch.id, &predictions, &outbox).await? {
            info!(watch_id = %watch.id, "Watch already processed elsewhere");
            return Ok(Generation::Created(Vec::new()));
        }

        info!(
            watch_id = %watch.id,
            base_event_type = %base_event.event_type,
            predictions = predictions.len(),
            "Generated predictions"
        );

        Ok(Generation::Created(predictions))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_prediction(
        &self,
        watch: &TriggeredWatch,
        base_event: &Event,
        rule: &PredictionRule,
        outcome: &PredictedOutcome,
        patterns: &HistoricalPatterns,
        graph: &GraphContext,
        inputs: PredictionInputs,
        now: DateTime<Utc>,
    ) -> EventPrediction {
        let probability = adjusted_probability(outcome.probability, inputs.multiplier);
        let support = patterns.support_for(&outcome.event_type);

        EventPrediction {
            id: Uuid::new_v4(),
            watch_id: watch.id,
            base_event_id: base_event.id,
            predicted_event_type: outcome.event_type.clone(),
            prediction_probability: probability,
            prediction_window_days: outcome.window_days,
            target_date_estimate: now + Duration::days(outcome.window_days),
            status: PredictionStatus::Pending,
            fulfilled_at: None,
            actual_event_id: None,
            prediction_context: json!({
                "pattern": rule.name,
                "base_event_type": base_event.event_type,
                "base_probability": outcome.probability,
                "probability_multiplier": inputs.multiplier,
                "importance_score": inputs.importance,
                "price_impact": inputs.price_impact,
                "historical_support": support,
                "historical_sample_size": patterns.sampled_base_events,
                "graph_context": graph,
                "generated_at": now,
            }),
            created_at: now,
        }
    }

    /// Graph neighbourhood of an event. Missing or failing graph store yields
    /// an empty context.
    async fn ceg_context(&self, event_id: Uuid) -> GraphContext {
        let Some(graph) = &self.graph else {
            return GraphContext::default();
        };
        match graph.event_context(event_id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(event_id = %event_id, "Graph context unavailable: {:#}", e);
                GraphContext::default()
            }
        }
    }

    async fn price_impact(&self, base_event: &Event) -> Option<f64> {
        let analyzer = self.analyzer.as_ref()?;
        let ticker = base_event.tickers().into_iter().next()?;
        analyzer
            .impact_or_unknown(&ticker, base_event.timestamp.date_naive())
            .await
            .map(|result| result.impact_score)
    }

    pub async fn process_pending_watches(&self) -> Result<WatchPassReport> {
        self.process_pending_watches_at(Utc::now()).await
    }

    /// Expire stale L2 watches and generate predictions for the rest.
    /// A failing watch is logged and left for the next pass.
    pub async fn process_pending_watches_at(&self, now: DateTime<Utc>) -> Result<WatchPassReport> {
        let watches = self
            .store
            .triggered_watches(WatchLevel::L2, self.config.watch_batch_size)
            .await?;

        let mut report = WatchPassReport::default();
        for watch in watches {
            report.examined += 1;

            if watch.is_past_expiry(now) {
                match self.store.expire_watch(watch.id).await {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(watch_id = %watch.id, "Failed to expire watch: {:#}", e);
                        report.errors += 1;
                    }
                }
                continue;
            }

            match self.generate(&watch, None, now).await {
                Ok(Generation::Created(predictions)) => {
                    report.processed += 1;
                    report.predictions_created += predictions.len();
                }
                Ok(Generation::MissingBaseEvent) => report.skipped += 1,
                Err(e) => {
                    warn!(watch_id = %watch.id, "Prediction generation failed: {:#}", e);
                    report.errors += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                skipped = report.skipped,
                predictions = report.predictions_created,
                "Watch pass complete"
            );
        }
        Ok(report)
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Settle pending predictions older than the minimum age: fulfilled by a
    /// matching event inside the window, expired once the window has passed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - Duration::minutes(self.config.min_age_minutes);
        let pending = self.store.pending_predictions(cutoff).await?;

        let mut report = SweepReport::default();
        for prediction in pending {
            report.examined += 1;
            match self.settle(&prediction, now).await {
                Ok(SweepOutcome::Fulfilled) => report.fulfilled += 1,
                Ok(SweepOutcome::Expired) => report.expired += 1,
                Ok(SweepOutcome::StillPending) => report.still_pending += 1,
                Ok(SweepOutcome::Conflict) => report.conflicts += 1,
                Err(e) => {
                    warn!(prediction_id = %prediction.id, "Failed to settle prediction: {:#}", e);
                    report.errors += 1;
                }
            }
        }

        if report.fulfilled + report.expired > 0 {
            info!(
                fulfilled = report.fulfilled,
                expired = report.expired,
                still_pending = report.still_pending,
                "Prediction sweep complete"
            );
        }
        Ok(report)
    }

    async fn settle(&self, prediction: &EventPrediction, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let base_event = self.store.get_event(prediction.base_event_id).await?;
        let window_start = base_event
            .as_ref()
            .map_or(prediction.created_at, |e| e.timestamp.max(prediction.created_at));
        let window_end = prediction.target_date_estimate;

        let candidates = if window_start <= window_end {
            self.store.events_between(window_start, window_end).await?
        } else {
            Vec::new()
        };

        let matched = candidates.into_iter().find(|e| {
            e.id != prediction.base_event_id
                && self
                    .aliases
                    .matches(&prediction.predicted_event_type, &e.event_type)
        });

        if let Some(actual) = matched {
            let message = fulfilled_message(prediction, &actual, now);
            let transition = PredictionTransition::Fulfilled {
                actual_event_id: actual.id,
                fulfilled_at: now,
            };
            if !self.store.transition(prediction.id, transition, &message).await? {
                return Ok(SweepOutcome::Conflict);
            }
            debug!(
                prediction_id = %prediction.id,
                actual_event_id = %actual.id,
                "Prediction fulfilled"
            );
            return Ok(SweepOutcome::Fulfilled);
        }

        if now > prediction.target_date_estimate {
            let message = expired_message(prediction, now);
            if !self
                .store
                .transition(prediction.id, PredictionTransition::Expired, &message)
                .await?
            {
                return Ok(SweepOutcome::Conflict);
            }
            debug!(prediction_id = %prediction.id, "Prediction expired");
            return Ok(SweepOutcome::Expired);
        }

        Ok(SweepOutcome::StillPending)
    }

    pub async fn accuracy_report(&self) -> Result<AccuracyReport> {
        Ok(AccuracyReport::from_counts(self.store.status_counts().await?))
    }
}

struct PredictionInputs {
    importance: Option<f64>,
    price_impact: Option<f64>,
    multiplier: f64,
}

fn created_message(prediction: &EventPrediction) -> OutboxEvent {
    OutboxEvent::new(
        PREDICTION_CREATED,
        prediction.id.to_string(),
        json!({
            "prediction_id": prediction.id,
            "watch_id": prediction.watch_id,
            "base_event_id": prediction.base_event_id,
            "predicted_event_type": prediction.predicted_event_type,
            "prediction_probability": prediction.prediction_probability,
            "target_date_estimate": prediction.target_date_estimate,
        }),
    )
}

fn fulfilled_message(prediction: &EventPrediction, actual: &Event, now: DateTime<Utc>) -> OutboxEvent {
    OutboxEvent::new(
        PREDICTION_FULFILLED,
        prediction.id.to_string(),
        json!({
            "prediction_id": prediction.id,
            "predicted_event_type": prediction.predicted_event_type,
            "actual_event_id": actual.id,
            "actual_event_type": actual.event_type,
            "fulfilled_at": now,
        }),
    )
}

fn expired_message(prediction: &EventPrediction, now: DateTime<Utc>) -> OutboxEvent {
    OutboxEvent::new(
        PREDICTION_EXPIRED,
        prediction.id.to_string(),
        json!({
            "prediction_id": prediction.id,
            "predicted_event_type": prediction.predicted_event_type,
            "target_date_estimate": prediction.target_date_estimate,
            "expired_at": now,
        }),
    )
}
