// src/feeds.rs

use crate::aggregator::{ApyMap, PriceMap};
use crate::metrics;
use anyhow::Result;
use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Shared price/APY cache filled by the feed updater and snapshotted once per poll cycle.
///
/// Each successful refresh replaces a map wholesale, so keys the feed stopped reporting
/// disappear. Absence of a key is a valid "unknown" state. An empty price map means the
/// feed has not delivered yet and makes the scheduler retry.
#[derive(Clone, Default)]
pub struct SharedFeedCache {
    prices: Arc<ArcSwap<PriceMap>>,
    apy: Arc<ArcSwap<ApyMap>>,
    last_successful_update: Arc<AtomicU64>,
    consecutive_failures: Arc<AtomicU32>,
}

impl SharedFeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_prices(&self, prices: PriceMap) {
        self.prices.store(Arc::new(prices));
    }

    pub fn update_apy(&self, apy: ApyMap) {
        self.apy.store(Arc::new(apy));
    }

    pub fn price(&self, oracle_id: &str) -> Option<f64> {
        self.prices.load().get(oracle_id).copied()
    }

    pub fn prices(&self) -> PriceMap {
        self.prices.load().as_ref().clone()
    }

    pub fn apy(&self) -> ApyMap {
        self.apy.load().as_ref().clone()
    }

    pub fn has_prices(&self) -> bool {
        !self.prices.load().is_empty()
    }

    /// Healthy while fewer than 3 refreshes in a row have failed.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < 3
    }

    pub fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_successful_update.store(now, Ordering::Relaxed);
    }

    pub fn mark_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Unix seconds of the last successful refresh, if any.
    pub fn last_successful_update(&self) -> Option<u64> {
        match self.last_successful_update.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }
}

/// Turns a feed response (`{ "<key>": <number | "number" | null> }`) into a numeric map.
/// Entries that are null or not numeric are dropped.
pub fn parse_feed_map(value: serde_json::Value) -> Result<HashMap<String, f64>> {
    let object = match value {
        serde_json::Value::Object(object) => object,
        other => anyhow::bail!("expected a JSON object, got {}", json_kind(&other)),
    };

    let mut parsed = HashMap::with_capacity(object.len());
    for (key, value) in object {
        let number = match &value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match number {
            Some(n) if n.is_finite() => {
                parsed.insert(key, n);
            }
            _ => debug!("Skipping non-numeric feed entry {}", key),
        }
    }
    Ok(parsed)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Background updater that polls the HTTP price and APY endpoints into a [`SharedFeedCache`].
pub struct HttpFeedUpdater {
    cache: SharedFeedCache,
    prices_url: String,
    apy_url: Option<String>,
    update_interval: Duration,
    client: reqwest::Client,
}

impl HttpFeedUpdater {
    pub fn new(
        cache: SharedFeedCache,
        prices_url: String,
        apy_url: Option<String>,
        update_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        if update_interval.is_zero() {
            anyhow::bail!("feed refresh interval must be greater than zero");
        }
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            cache,
            prices_url,
            apy_url,
            update_interval,
            client,
        })
    }

    pub async fn start(self: Arc<Self>) {
        info!("🚀 Starting feed updater");
        info!("   Prices: {}", self.prices_url);
        if let Some(apy_url) = &self.apy_url {
            info!("   APY: {}", apy_url);
        }
        info!("   Interval: {:?}", self.update_interval);

        let mut ticker = interval(self.update_interval);
        let mut iteration = 0u64;

        loop {
            ticker.tick().await;
            iteration += 1;

            match self.refresh().await {
                Ok((prices, apy)) => {
                    info!("✅ [Feeds #{}] {} prices, {} apy entries", iteration, prices, apy);
                    self.cache.mark_success();
                }
                Err(e) => {
                    self.cache.mark_failure();
                    error!("❌ [Feeds #{}] refresh failed: {}", iteration, e);
                    if !self.cache.is_healthy() {
                        warn!("🚨 Feed updater is unhealthy, prices may be stale");
                    }
                }
            }
        }
    }

    /// Fetches both feeds once. Returns the number of entries stored for each.
    pub async fn refresh(&self) -> Result<(usize, usize)> {
        let prices = match self.fetch_map(&self.prices_url).await {
            Ok(prices) => {
                metrics::increment_feed_refresh("prices", "ok");
                prices
            }
            Err(e) => {
                metrics::increment_feed_refresh("prices", "error");
                return Err(e);
            }
        };
        let price_count = prices.len();
        self.cache.update_prices(prices);

        let mut apy_count = 0;
        if let Some(apy_url) = &self.apy_url {
            match self.fetch_map(apy_url).await {
                Ok(apy) => {
                    metrics::increment_feed_refresh("apy", "ok");
                    apy_count = apy.len();
                    self.cache.update_apy(apy);
                }
                Err(e) => {
                    metrics::increment_feed_refresh("apy", "error");
                    warn!("⚠️ APY feed refresh failed: {}", e);
                }
            }
        }

        Ok((price_count, apy_count))
    }

    async fn fetch_map(&self, url: &str) -> Result<HashMap<String, f64>> {
        let value: serde_json::Value = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_feed_map(value)
    }
}
