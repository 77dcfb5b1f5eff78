//! Market impact analysis (event study)
//!
//! Answers one question: did a given event actually move a given instrument?
//! Returns are compared against an estimation-period baseline and the excess
//! around the event day is scored.

mod analyzer;
mod config;
mod provider;

pub use analyzer::{compute_impact, EventWindow, ImpactError, MarketImpactAnalyzer, MarketImpactResult};
pub use config::{AnalyzerConfig, MarketDataConfig};
pub use provider::{
    normalize_bars, HttpMarketData, InMemoryMarketData, MarketDataProvider, PgPriceHistory, PriceBar,
};
