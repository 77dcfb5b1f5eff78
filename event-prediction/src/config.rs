//! Prediction engine configuration
//!
//! The rule table maps trigger keywords found in an event type to the follow-on
//! event types worth forecasting. The alias table groups event types into
//! categories so a forecast of `trade_restrictions` is fulfilled by any
//! sanctions-family event.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Trigger keyword families and what each one forecasts
    #[serde(default = "default_rules")]
    pub rules: Vec<PredictionRule>,

    /// Category name -> event types that count as the same category
    #[serde(default = "default_category_aliases")]
    pub category_aliases: BTreeMap<String, Vec<String>>,

    /// Predicted types containing any of these words receive the price impact term
    #[serde(default = "default_market_keywords")]
    pub market_keywords: Vec<String>,

    /// How far back to sample same-type events for recurrence statistics
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Follow-up horizon after each sampled event
    #[serde(default = "default_follow_window_days")]
    pub follow_window_days: i64,

    #[serde(default = "default_max_pattern_samples")]
    pub max_pattern_samples: usize,

    /// Predictions younger than this are left alone by the sweep
    #[serde(default = "default_min_age_minutes")]
    pub min_age_minutes: i64,

    #[serde(default = "default_watch_batch_size")]
    pub watch_batch_size: i64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            category_aliases: default_category_aliases(),
            market_keywords: default_market_keywords(),
            lookback_days: default_lookback_days(),
            follow_window_days: default_follow_window_days(),
            max_pattern_samples: default_max_pattern_samples(),
            min_age_minutes: default_min_age_minutes(),
            watch_batch_size: default_watch_batch_size(),
        }
    }
}

impl PredictionConfig {
    /// Parse a TOML document; missing sections fall back to the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PredictionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            if rule.trigger_keywords.is_empty() {
                bail!("rule {} has no trigger keywords", rule.name);
            }
            if rule.outcomes.is_empty() {
                bail!("rule {} has no predicted outcomes", rule.name);
            }
            for outcome in &rule.outcomes {
                if !(0.0..=1.0).contains(&outcome.probability) {
                    bail!(
                        "rule {}: probability {} for {} is outside [0, 1]",
                        rule.name,
                        outcome.probability,
                        outcome.event_type
                    );
                }
                if outcome.window_days <= 0 {
                    bail!(
                        "rule {}: window for {} must be positive",
                        rule.name,
                        outcome.event_type
                    );
                }
            }
        }
        if self.max_pattern_samples == 0 {
            bail!("max_pattern_samples must be positive");
        }
        Ok(())
    }
}

/// One keyword family of the rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRule {
    pub name: String,
    /// Matched as lowercase substrings of the base event type
    pub trigger_keywords: Vec<String>,
    pub outcomes: Vec<PredictedOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedOutcome {
    pub event_type: String,
    /// Base probability before the context multiplier
    pub probability: f64,
    pub window_days: i64,
}

fn outcome(event_type: &str, probability: f64, window_days: i64) -> PredictedOutcome {
    PredictedOutcome {
        event_type: event_type.to_string(),
        probability,
        window_days,
    }
}

fn rule(name: &str, keywords: &[&str], outcomes: Vec<PredictedOutcome>) -> PredictionRule {
    PredictionRule {
        name: name.to_string(),
        trigger_keywords: keywords.iter().map(|k| k.to_string()).collect(),
        outcomes,
    }
}

fn default_rules() -> Vec<PredictionRule> {
    vec![
        rule(
            "sanctions_impact",
            &["sanctions"],
            vec![
                outcome("market_volatility", 0.7, 3),
                outcome("currency_fluctuation", 0.6, 7),
                outcome("trade_restrictions", 0.5, 14),
            ],
        ),
        rule(
            "rate_change",
            &["rate", "interest"],
            vec![
                outcome("market_reaction", 0.8, 1),
                outcome("currency_movement", 0.7, 3),
                outcome("bond_yield_change", 0.6, 7),
            ],
        ),
        rule(
            "earnings_impact",
            &["earnings", "quarterly"],
            vec![
                outcome("stock_movement", 0.75, 1),
                outcome("analyst_revision", 0.6, 7),
                outcome("sector_reaction", 0.4, 3),
            ],
        ),
        rule(
            "market_volatility",
            &["volatility", "market"],
            vec![
                outcome("risk_off_sentiment", 0.6, 2),
                outcome("safe_haven_flows", 0.5, 5),
                outcome("liquidity_stress", 0.35, 7),
            ],
        ),
    ]
}

fn aliases(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_category_aliases() -> BTreeMap<String, Vec<String>> {
    let mut table = BTreeMap::new();
    table.insert(
        "sanctions".to_string(),
        aliases(&["sanctions_compliance", "trade_restrictions", "banking_limitations", "asset_freeze"]),
    );
    table.insert(
        "monetary_policy".to_string(),
        aliases(&["rate_cut", "rate_hike", "rate_decision", "bond_yield_change"]),
    );
    table.insert(
        "market_volatility".to_string(),
        aliases(&["market_reaction", "volatility_spike", "market_selloff", "risk_off_sentiment"]),
    );
    table.insert(
        "currency".to_string(),
        aliases(&["currency_fluctuation", "currency_movement", "fx_intervention"]),
    );
    table.insert(
        "earnings".to_string(),
        aliases(&["earnings_miss", "earnings_beat", "analyst_revision", "guidance_change"]),
    );
    table
}

fn default_market_keywords() -> Vec<String> {
    vec!["market".to_string(), "volatility".to_string()]
}

fn default_lookback_days() -> i64 {
    90
}

fn default_follow_window_days() -> i64 {
    30
}

fn default_max_pattern_samples() -> usize {
    50
}

fn default_min_age_minutes() -> i64 {
    60
}

fn default_watch_batch_size() -> i64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PredictionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rules.len(), 4);
        assert_eq!(config.lookback_days, 90);
        assert_eq!(config.follow_window_days, 30);
        assert_eq!(config.max_pattern_samples, 50);
    }

    #[test]
    fn test_toml_rule_table() {
        let config = PredictionConfig::from_toml_str(
            r#"
            lookback_days = 60

            [[rules]]
            name = "tariffs"
            trigger_keywords = ["tariff"]
            outcomes = [
                { event_type = "trade_restrictions", probability = 0.55, window_days = 10 },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.lookback_days, 60);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].outcomes[0].window_days, 10);
        // Untouched sections keep their defaults
        assert!(config.category_aliases.contains_key("sanctions"));
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let result = PredictionConfig::from_toml_str(
            r#"
            [[rules]]
            name = "bad"
            trigger_keywords = ["x"]
            outcomes = [{ event_type = "y", probability = 1.5, window_days = 1 }]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_outcomes_rejected() {
        let mut config = PredictionConfig::default();
        config.rules[0].outcomes.clear();
        assert!(config.validate().is_err());
    }
}
