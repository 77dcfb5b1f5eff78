use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;
use crate::provider::{normalize_bars, MarketDataProvider, PriceBar};

/// Guards divisions by a zero standard deviation
const EPSILON: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum ImpactError {
    /// Not enough history to form a verdict. Callers treat this as "impact unknown".
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("market data unavailable: {0}")]
    Upstream(#[source] anyhow::Error),
}

/// Offsets of the event window relative to the event day, both inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub start: i64,
    pub end: i64,
}

impl EventWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

impl Default for EventWindow {
    fn default() -> Self {
        Self { start: -1, end: 1 }
    }
}

/// Verdict for one (instrument, event date) pair. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketImpactResult {
    /// Abnormal return on the event day
    pub ar: f64,
    /// Cumulative abnormal return over the event window
    pub car: f64,
    pub volume_spike: f64,
    pub estimation_mean: f64,
    pub estimation_std: f64,
    pub is_significant: bool,
    pub impact_score: f64,
    pub market_confidence: f64,
    /// Trading day the event was snapped to
    pub event_day: NaiveDate,
    pub window_abnormal_returns: Vec<f64>,
}

struct DailyReturn {
    date: NaiveDate,
    value: f64,
    volume: f64,
}

fn daily_returns(bars: &[PriceBar]) -> Vec<DailyReturn> {
    bars.windows(2)
        .filter_map(|pair| {
            let (prev, curr) = (pair[0], pair[1]);
            if prev.close > 0.0 && prev.close.is_finite() && curr.close.is_finite() {
                Some(DailyReturn {
                    date: curr.date,
                    value: (curr.close - prev.close) / prev.close,
                    volume: curr.volume,
                })
            } else {
                None
            }
        })
        .collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Run the event study over bars already in hand.
pub fn compute_impact(
    bars: &[PriceBar],
    event_date: NaiveDate,
    estimation_window: usize,
    window: EventWindow,
    config: &AnalyzerConfig,
) -> Result<MarketImpactResult, ImpactError> {
    if window.start > window.end {
        return Err(ImpactError::InsufficientData(format!(
            "event window [{}, {}] is empty",
            window.start, window.end
        )));
    }

    let returns = daily_returns(bars);
    if returns.len() < estimation_window {
        return Err(ImpactError::InsufficientData(format!(
            "{} usable returns, need {}",
            returns.len(),
            estimation_window
        )));
    }

    let event_idx = returns
        .iter()
        .position(|r| r.date == event_date)
        .or_else(|| returns.iter().position(|r| r.date >= event_date))
        .ok_or_else(|| {
            ImpactError::InsufficientData(format!("no trading day on or after {}", event_date))
        })?;

    let estimation = &returns[event_idx.saturating_sub(estimation_window)..event_idx];
    if estimation.len() < config.min_estimation_samples {
        return Err(ImpactError::InsufficientData(format!(
            "{} estimation returns before {}, need {}",
            estimation.len(),
            event_date,
            config.min_estimation_samples
        )));
    }

    let estimation_returns: Vec<f64> = estimation.iter().map(|r| r.value).collect();
    let mean_return = estimation_returns.iter().mean();
    let std_return = estimation_returns.iter().std_dev();

    let last = returns.len() as i64 - 1;
    let lo = (event_idx as i64 + window.start).clamp(0, last) as usize;
    let hi = (event_idx as i64 + window.end).clamp(0, last) as usize;
    let window_abnormal_returns: Vec<f64> = returns[lo..=hi]
        .iter()
        .map(|r| r.value - mean_return)
        .collect();
    let car: f64 = window_abnormal_returns.iter().sum();
    let ar = returns[event_idx].value - mean_return;

    let mean_volume = estimation.iter().map(|r| r.volume).mean();
    let volume_spike = if mean_volume > 0.0 && mean_volume.is_finite() {
        returns[event_idx].volume / mean_volume
    } else {
        1.0
    };

    let is_significant = ar.abs() > config.significance_sigma * std_return
        || volume_spike > config.volume_spike_threshold;

    let z = ar.abs() / (std_return + EPSILON);
    let impact_score = z.min(1.0);
    let market_confidence = if is_significant {
        sigmoid(z - 2.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Ok(MarketImpactResult {
        ar,
        car,
        volume_spike,
        estimation_mean: mean_return,
        estimation_std: std_return,
        is_significant,
        impact_score,
        market_confidence,
        event_day: returns[event_idx].date,
        window_abnormal_returns,
    })
}

/// Event-study analyzer over a market data provider. Stateless; share freely.
pub struct MarketImpactAnalyzer {
    provider: Arc<dyn MarketDataProvider>,
    config: AnalyzerConfig,
}

impl MarketImpactAnalyzer {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: AnalyzerConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze with the configured estimation and event windows
    pub async fn analyze(
        &self,
        instrument: &str,
        event_date: NaiveDate,
    ) -> Result<MarketImpactResult, ImpactError> {
        let window = EventWindow::new(self.config.event_window_start, self.config.event_window_end);
        self.analyze_with(instrument, event_date, self.config.estimation_window_days, window)
            .await
    }

    pub async fn analyze_with(
        &self,
        instrument: &str,
        event_date: NaiveDate,
        estimation_window_days: usize,
        window: EventWindow,
    ) -> Result<MarketImpactResult, ImpactError> {
        let buffer = self.config.fetch_buffer_days;
        let from = event_date
            - Duration::days(estimation_window_days as i64 + window.start.abs() + buffer);
        let to = event_date + Duration::days(window.end.max(0) + buffer);

        let bars = self
            .provider
            .get_historical_prices(instrument, from, to)
            .await
            .map_err(ImpactError::Upstream)?;

        debug!(
            instrument = %instrument,
            event_date = %event_date,
            bars = bars.len(),
            "Running event study"
        );

        compute_impact(
            &normalize_bars(bars),
            event_date,
            estimation_window_days,
            window,
            &self.config,
        )
    }

    /// Analyze, folding every failure into "impact unknown".
    pub async fn impact_or_unknown(
        &self,
        instrument: &str,
        event_date: NaiveDate,
    ) -> Option<MarketImpactResult> {
        match self.analyze(instrument, event_date).await {
            Ok(result) => Some(result),
            Err(ImpactError::InsufficientData(reason)) => {
                debug!(instrument = %instrument, "No impact verdict: {}", reason);
                None
            }
            Err(e) => {
                warn!(instrument = %instrument, "Market impact unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryMarketData;
    use async_trait::async_trait;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    /// Bars on consecutive calendar days from `start()`, starting at 100.0
    fn bars_from_returns(returns: &[f64], volumes: &[f64]) -> Vec<PriceBar> {
        let mut close = 100.0;
        let mut bars = vec![PriceBar::new(start(), close, 1_000.0)];
        for (i, r) in returns.iter().enumerate() {
            close *= 1.0 + r;
            let volume = volumes.get(i).copied().unwrap_or(1_000.0);
            bars.push(PriceBar::new(start() + Duration::days(i as i64 + 1), close, volume));
        }
        bars
    }

    fn alternating(n: usize) -> Vec<f64> {
        (0..n).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect()
    }

    #[test]
    fn test_significant_event_day_return() {
        // 30 alternating estimation returns, then the event day and one day after
        let mut returns = alternating(30);
        returns.push(0.05);
        returns.push(0.0);
        let bars = bars_from_returns(&returns, &[]);
        let event_date = start() + Duration::days(31);

        let result = compute_impact(&bars, event_date, 30, EventWindow::default(), &AnalyzerConfig::default())
            .unwrap();

        assert_eq!(result.event_day, event_date);
        assert!(result.estimation_mean.abs() < 1e-3);
        assert!((result.estimation_std - 0.01).abs() < 1e-3);
        assert!((result.ar - 0.05).abs() < 1e-3);
        assert!(result.is_significant);
        assert!(result.market_confidence > 0.5);
        assert_eq!(result.impact_score, 1.0);
    }

    #[test]
    fn test_car_is_sum_of_window_abnormal_returns() {
        let mut returns = alternating(40);
        returns.extend([0.02, -0.03, 0.04, 0.01, -0.02]);
        let bars = bars_from_returns(&returns, &[]);
        let event_date = start() + Duration::days(42);

        let config = AnalyzerConfig::default();
        let result = compute_impact(&bars, event_date, 30, EventWindow::new(-2, 2), &config).unwrap();

        assert_eq!(result.window_abnormal_returns.len(), 5);
        let sum: f64 = result.window_abnormal_returns.iter().sum();
        assert_eq!(result.car, sum);
        // Event day sits at |start| inside the window
        assert_eq!(result.ar, result.window_abnormal_returns[2]);
    }

    #[test]
    fn test_inverted_window_is_insufficient_data() {
        let mut returns = alternating(40);
        returns.extend([0.02, -0.03, 0.04]);
        let bars = bars_from_returns(&returns, &[]);
        let event_date = start() + Duration::days(41);

        let err = compute_impact(&bars, event_date, 30, EventWindow::new(2, -2), &AnalyzerConfig::default())
            .unwrap_err();
        assert!(matches!(err, ImpactError::InsufficientData(_)));
    }

    #[test]
    fn test_flat_prices_use_volume_only() {
        let returns = vec![0.0; 35];
        let mut volumes = vec![1_000.0; 35];
        volumes[31] = 2_500.0;
        let bars = bars_from_returns(&returns, &volumes);
        let event_date = start() + Duration::days(32);

        let config = AnalyzerConfig::default();
        let result = compute_impact(&bars, event_date, 30, EventWindow::default(), &config).unwrap();
        assert_eq!(result.estimation_std, 0.0);
        assert!(result.impact_score.is_finite());
        assert_eq!(result.impact_score, 0.0);
        assert!((result.volume_spike - 2.5).abs() < 1e-9);
        assert!(result.is_significant);

        // Same series without the volume spike
        let bars = bars_from_returns(&returns, &[]);
        let quiet = compute_impact(&bars, event_date, 30, EventWindow::default(), &config).unwrap();
        assert!(!quiet.is_significant);
        assert_eq!(quiet.market_confidence, 0.0);
    }

    #[test]
    fn test_zero_volume_baseline_defaults_spike() {
        let returns = alternating(35);
        let volumes = vec![0.0; 35];
        let bars = bars_from_returns(&returns, &volumes);
        let event_date = start() + Duration::days(33);

        let result =
            compute_impact(&bars, event_date, 30, EventWindow::default(), &AnalyzerConfig::default()).unwrap();
        assert_eq!(result.volume_spike, 1.0);
    }

    #[test]
    fn test_event_date_snaps_forward() {
        let returns = alternating(40);
        let mut bars = bars_from_returns(&returns, &[]);
        let missing = start() + Duration::days(35);
        bars.retain(|b| b.date != missing);

        let result =
            compute_impact(&bars, missing, 20, EventWindow::default(), &AnalyzerConfig::default()).unwrap();
        assert_eq!(result.event_day, missing + Duration::days(1));
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let bars = bars_from_returns(&alternating(12), &[]);
        let err = compute_impact(
            &bars,
            start() + Duration::days(10),
            30,
            EventWindow::default(),
            &AnalyzerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ImpactError::InsufficientData(_)));
    }

    #[test]
    fn test_event_too_early_for_estimation() {
        let bars = bars_from_returns(&alternating(40), &[]);
        let err = compute_impact(
            &bars,
            start() + Duration::days(5),
            30,
            EventWindow::default(),
            &AnalyzerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ImpactError::InsufficientData(_)));
    }

    #[test]
    fn test_event_after_history_is_insufficient() {
        let bars = bars_from_returns(&alternating(40), &[]);
        let err = compute_impact(
            &bars,
            start() + Duration::days(90),
            30,
            EventWindow::default(),
            &AnalyzerConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ImpactError::InsufficientData(_)));
    }

    #[tokio::test]
    async fn test_analyzer_fetches_from_provider() {
        let provider = Arc::new(InMemoryMarketData::new());
        let mut returns = alternating(30);
        returns.extend([0.06, 0.0]);
        provider.insert("ACME", bars_from_returns(&returns, &[])).await;

        let analyzer = MarketImpactAnalyzer::new(provider, AnalyzerConfig::default());
        let result = analyzer
            .analyze("ACME", start() + Duration::days(31))
            .await
            .unwrap();
        assert!(result.is_significant);

        assert!(analyzer.impact_or_unknown("NOPE", start()).await.is_none());
    }

    struct BrokenProvider;

    #[async_trait]
    impl MarketDataProvider for BrokenProvider {
        async fn get_historical_prices(
            &self,
            _instrument: &str,
            _from: NaiveDate,
            _to: NaiveDate,
        ) -> anyhow::Result<Vec<PriceBar>> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_provider_failure_is_upstream_error() {
        let analyzer = MarketImpactAnalyzer::new(Arc::new(BrokenProvider), AnalyzerConfig::default());
        let err = analyzer.analyze("ACME", start()).await.unwrap_err();
        assert!(matches!(err, ImpactError::Upstream(_)));
        assert!(analyzer.impact_or_unknown("ACME", start()).await.is_none());
    }
}
