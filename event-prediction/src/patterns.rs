//! Historical recurrence: what tends to follow events of the same type

use anyhow::Result;
use chrono::Duration;
use common::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::PredictionConfig;
use crate::store::PredictionStore;

/// How often a follow-up type appeared after past events of the base type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowUpStats {
    pub count: usize,
    pub avg_delay_days: f64,
    /// `count / sampled_base_events`
    pub frequency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPatterns {
    pub sampled_base_events: usize,
    pub follow_ups: BTreeMap<String, FollowUpStats>,
}

impl HistoricalPatterns {
    pub fn support_for(&self, event_type: &str) -> Option<&FollowUpStats> {
        self.follow_ups.get(event_type)
    }
}

/// Sample past events of the same type as `base` and aggregate what followed
/// each of them within the follow window.
pub async fn historical_patterns(
    store: &dyn PredictionStore,
    base: &Event,
    config: &PredictionConfig,
) -> Result<HistoricalPatterns> {
    let from = base.timestamp - Duration::days(config.lookback_days);
    let mut samples = store
        .events_of_type_between(&base.event_type, from, base.timestamp, config.max_pattern_samples + 1)
        .await?;
    samples.retain(|e| e.id != base.id);
    samples.truncate(config.max_pattern_samples);

    if samples.is_empty() {
        return Ok(HistoricalPatterns::default());
    }

    // Samples are newest first; one query covers every follow window
    let follow_window = Duration::days(config.follow_window_days);
    let oldest = samples[samples.len() - 1].timestamp;
    let newest = samples[0].timestamp;
    let candidates = store.events_between(oldest, newest + follow_window).await?;

    // type -> (count, summed delay in days)
    let mut totals: BTreeMap<String, (usize, f64)> = BTreeMap::new();
    for past in &samples {
        let horizon = past.timestamp + follow_window;
        let lo = candidates.partition_point(|e| e.timestamp <= past.timestamp);
        let hi = candidates.partition_point(|e| e.timestamp <= horizon);

        for follow_up in &candidates[lo..hi.max(lo)] {
            let delay_days =
                (follow_up.timestamp - past.timestamp).num_seconds() as f64 / 86_400.0;
            let entry = totals.entry(follow_up.event_type.clone()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += delay_days;
        }
    }

    let sampled = samples.len();
    let follow_ups = totals
        .into_iter()
        .map(|(event_type, (count, delay_sum))| {
            let stats = FollowUpStats {
                count,
                avg_delay_days: delay_sum / count as f64,
                frequency: count as f64 / sampled as f64,
            };
            (event_type, stats)
        })
        .collect();

    Ok(HistoricalPatterns {
        sampled_base_events: sampled,
        follow_ups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPredictionStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_follow_up_aggregation() {
        let store = InMemoryPredictionStore::new();
        let now = Utc::now();

        let base = Event::new("sanctions", "New sanctions package", now);
        let past_a = Event::new("sanctions", "Earlier sanctions", now - Duration::days(20));
        let past_b = Event::new("sanctions", "Older sanctions", now - Duration::days(50));
        let too_old = Event::new("sanctions", "Ancient sanctions", now - Duration::days(120));

        let follow_ups = vec![
            Event::new("market_volatility", "Stocks swing", past_a.timestamp + Duration::days(2)),
            Event::new("market_volatility", "Stocks swing again", past_b.timestamp + Duration::days(4)),
            Event::new("currency_fluctuation", "Ruble drops", past_b.timestamp + Duration::days(6)),
            // Outside the 30 day follow window
            Event::new("bond_yield_change", "Yields up", past_b.timestamp + Duration::days(40)),
        ];

        for event in [base.clone(), past_a, past_b, too_old].into_iter().chain(follow_ups) {
            store.insert_event(event).await;
        }

        let patterns = historical_patterns(&store, &base, &PredictionConfig::default())
            .await
            .unwrap();

        assert_eq!(patterns.sampled_base_events, 2);

        let volatility = patterns.support_for("market_volatility").unwrap();
        assert_eq!(volatility.count, 2);
        assert!((volatility.avg_delay_days - 3.0).abs() < 1e-9);
        assert!((volatility.frequency - 1.0).abs() < 1e-9);

        let currency = patterns.support_for("currency_fluctuation").unwrap();
        assert_eq!(currency.count, 1);
        assert!((currency.frequency - 0.5).abs() < 1e-9);

        assert!(patterns.support_for("bond_yield_change").is_none());
    }

    #[tokio::test]
    async fn test_overlapping_follow_windows() {
        let store = InMemoryPredictionStore::new();
        let now = Utc::now();

        let base = Event::new("sanctions", "New sanctions package", now);
        let past_a = Event::new("sanctions", "Earlier sanctions", now - Duration::days(60));
        let past_b = Event::new("sanctions", "Follow-on sanctions", now - Duration::days(55));
        // Inside both follow windows
        let shared = Event::new("trade_restrictions", "Export ban", now - Duration::days(50));
        // Only inside past_b's window
        let late = Event::new("trade_restrictions", "Second ban", now - Duration::days(27));

        for event in [base.clone(), past_a, past_b, shared, late] {
            store.insert_event(event).await;
        }

        let patterns = historical_patterns(&store, &base, &PredictionConfig::default())
            .await
            .unwrap();

        assert_eq!(patterns.sampled_base_events, 2);
        let restrictions = patterns.support_for("trade_restrictions").unwrap();
        assert_eq!(restrictions.count, 3);
        assert!((restrictions.avg_delay_days - (10.0 + 5.0 + 28.0) / 3.0).abs() < 1e-6);
        assert!((restrictions.frequency - 1.5).abs() < 1e-9);

        // past_b follows past_a within its window
        let sanctions = patterns.support_for("sanctions").unwrap();
        assert_eq!(sanctions.count, 1);
    }

    #[tokio::test]
    async fn test_no_history() {
        let store = InMemoryPredictionStore::new();
        let base = Event::new("earnings_miss", "ACME misses", Utc::now());
        store.insert_event(base.clone()).await;

        let patterns = historical_patterns(&store, &base, &PredictionConfig::default())
            .await
            .unwrap();
        assert_eq!(patterns, HistoricalPatterns::default());
    }

    #[tokio::test]
    async fn test_sample_cap() {
        let store = InMemoryPredictionStore::new();
        let now = Utc::now();
        let base = Event::new("rate_hike", "Hike", now);
        store.insert_event(base.clone()).await;
        for i in 1..=8 {
            store
                .insert_event(Event::new("rate_hike", "Past hike", now - Duration::days(i)))
                .await;
        }

        let config = PredictionConfig {
            max_pattern_samples: 5,
            ..Default::default()
        };
        let patterns = historical_patterns(&store, &base, &config).await.unwrap();
        assert_eq!(patterns.sampled_base_events, 5);
    }
}
