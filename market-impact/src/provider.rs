use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::MarketDataConfig;

/// One daily bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    pub fn new(date: NaiveDate, close: f64, volume: f64) -> Self {
        Self { date, close, volume }
    }
}

/// Source of daily close/volume history.
///
/// Implementations must be safe to call concurrently; missing days are allowed.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_historical_prices(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>>;
}

/// Sort by date and keep the last bar seen for each day.
pub fn normalize_bars(mut bars: Vec<PriceBar>) -> Vec<PriceBar> {
    bars.sort_by_key(|b| b.date);
    let mut out: Vec<PriceBar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Price API client. One `reqwest::Client` is shared by every request.
pub struct HttpMarketData {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>, config: &MarketDataConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build market data HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketData {
    async fn get_historical_prices(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let url = format!("{}/prices/{}", self.base_url, instrument);
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();

        let mut request = self
            .client
            .get(&url)
            .query(&[("from", from.as_str()), ("to", to.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Price request for {} failed", instrument))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Price API error for {}: {}",
                instrument,
                response.status()
            ));
        }

        let bars: Vec<PriceBar> = response
            .json()
            .await
            .with_context(|| format!("Invalid price payload for {}", instrument))?;

        debug!("Fetched {} bars for {} ({} -> {})", bars.len(), instrument, from, to);
        Ok(normalize_bars(bars))
    }
}

/// Daily bars stored in Postgres
pub struct PgPriceHistory {
    pool: Arc<PgPool>,
}

impl PgPriceHistory {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_bars (
                instrument TEXT NOT NULL,
                date DATE NOT NULL,
                close DOUBLE PRECISION NOT NULL,
                volume DOUBLE PRECISION NOT NULL,
                PRIMARY KEY (instrument, date)
            );
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .context("Failed to create price_bars table")?;

        info!("Price history table initialized");
        Ok(())
    }

    pub async fn upsert_bar(&self, instrument: &str, bar: &PriceBar) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_bars (instrument, date, close, volume)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instrument, date) DO UPDATE
            SET close = EXCLUDED.close,
                volume = EXCLUDED.volume
            "#,
        )
        .bind(instrument)
        .bind(bar.date)
        .bind(bar.close)
        .bind(bar.volume)
        .execute(self.pool.as_ref())
        .await
        .context("Failed to store price bar")?;

        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for PgPriceHistory {
    async fn get_historical_prices(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query_as::<_, (NaiveDate, f64, f64)>(
            r#"
            SELECT date, close, volume
            FROM price_bars
            WHERE instrument = $1 AND date >= $2 AND date <= $3
            ORDER BY date
            "#,
        )
        .bind(instrument)
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.as_ref())
        .await
        .with_context(|| format!("Failed to fetch price bars for {}", instrument))?;

        Ok(rows
            .into_iter()
            .map(|(date, close, volume)| PriceBar { date, close, volume })
            .collect())
    }
}

/// In-memory bars (for testing and replay)
#[derive(Default)]
pub struct InMemoryMarketData {
    bars: RwLock<HashMap<String, Vec<PriceBar>>>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instrument: &str, bars: Vec<PriceBar>) {
        self.bars
            .write()
            .await
            .insert(instrument.to_string(), normalize_bars(bars));
    }
}

#[async_trait]
impl MarketDataProvider for InMemoryMarketData {
    async fn get_historical_prices(
        &self,
        instrument: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let bars = self.bars.read().await;
        Ok(bars
            .get(instrument)
            .map(|series| {
                series
                    .iter()
                    .filter(|b| b.date >= from && b.date <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let bars = vec![
            PriceBar::new(day(3), 12.0, 1.0),
            PriceBar::new(day(1), 10.0, 1.0),
            PriceBar::new(day(3), 13.0, 2.0),
            PriceBar::new(day(2), 11.0, 1.0),
        ];

        let normalized = normalize_bars(bars);
        let dates: Vec<_> = normalized.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![day(1), day(2), day(3)]);
        assert_eq!(normalized[2].close, 13.0);
    }

    #[tokio::test]
    async fn test_in_memory_range_filter() {
        let store = InMemoryMarketData::new();
        store
            .insert(
                "ACME",
                (1..=10).map(|d| PriceBar::new(day(d), 100.0 + d as f64, 1_000.0)).collect(),
            )
            .await;

        let bars = store.get_historical_prices("ACME", day(3), day(5)).await.unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].date, day(3));

        let missing = store.get_historical_prices("XYZ", day(1), day(5)).await.unwrap();
        assert!(missing.is_empty());
    }
}
