//! Market impact configuration

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Event-study parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Number of returns used to estimate the normal behaviour of the instrument
    #[serde(default = "default_estimation_window_days")]
    pub estimation_window_days: usize,

    /// First day of the event window, relative to the event day (usually negative)
    #[serde(default = "default_event_window_start")]
    pub event_window_start: i64,

    /// Last day of the event window, relative to the event day
    #[serde(default = "default_event_window_end")]
    pub event_window_end: i64,

    /// Extra calendar days fetched on both sides to absorb weekends and holidays
    #[serde(default = "default_fetch_buffer_days")]
    pub fetch_buffer_days: i64,

    /// Minimum estimation sample after clamping at the start of history
    #[serde(default = "default_min_estimation_samples")]
    pub min_estimation_samples: usize,

    /// |AR| above this many standard deviations is significant
    #[serde(default = "default_significance_sigma")]
    pub significance_sigma: f64,

    /// Volume ratio above which the event is significant regardless of returns
    #[serde(default = "default_volume_spike_threshold")]
    pub volume_spike_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            estimation_window_days: default_estimation_window_days(),
            event_window_start: default_event_window_start(),
            event_window_end: default_event_window_end(),
            fetch_buffer_days: default_fetch_buffer_days(),
            min_estimation_samples: default_min_estimation_samples(),
            significance_sigma: default_significance_sigma(),
            volume_spike_threshold: default_volume_spike_threshold(),
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.event_window_start > self.event_window_end {
            bail!(
                "event window start {} is after its end {}",
                self.event_window_start,
                self.event_window_end
            );
        }
        if self.estimation_window_days == 0 {
            bail!("estimation window must be at least one day");
        }
        if self.fetch_buffer_days < 0 {
            bail!("fetch buffer cannot be negative");
        }
        Ok(())
    }
}

fn default_estimation_window_days() -> usize {
    30
}

fn default_event_window_start() -> i64 {
    -1
}

fn default_event_window_end() -> i64 {
    1
}

fn default_fetch_buffer_days() -> i64 {
    15
}

fn default_min_estimation_samples() -> usize {
    10
}

fn default_significance_sigma() -> f64 {
    2.0
}

fn default_volume_spike_threshold() -> f64 {
    2.0
}

/// Where daily bars come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Base URL of the price API; `None` reads the `price_bars` table instead
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}
