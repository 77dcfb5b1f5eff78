//! Event prediction engine
//!
//! L2 watches produce forward predictions ("a `currency_fluctuation` within
//! 7 days"), scored from a keyword rule table, historical recurrence, the
//! causal graph and observed market impact. A periodic sweep later marks each
//! prediction fulfilled or expired, and accuracy is derived from those outcomes.

mod accuracy;
mod config;
mod engine;
mod graph;
mod patterns;
mod pg_store;
mod rules;
mod store;

pub use accuracy::{AccuracyReport, PredictionAccuracy};
pub use config::{PredictedOutcome, PredictionConfig, PredictionRule};
pub use engine::{
    adjusted_probability, probability_multiplier, EventPredictionEngine, SweepReport,
    WatchPassReport, MAX_PROBABILITY, PREDICTION_CREATED, PREDICTION_EXPIRED, PREDICTION_FULFILLED,
};
pub use graph::{GraphContext, GraphContextProvider, Neo4jGraphContext, StaticGraphContext};
pub use patterns::{historical_patterns, FollowUpStats, HistoricalPatterns};
pub use pg_store::PgPredictionStore;
pub use rules::{is_market_related, AliasTable, RuleTable};
pub use store::{InMemoryPredictionStore, PredictionStore, PredictionTransition, TypeStatusCounts};
