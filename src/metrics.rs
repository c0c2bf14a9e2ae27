// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "vault_poll_cycles_total",
        "Metrics cycles by outcome (published, too_soon, no_connections, prices_unavailable, failed)."
    );
    describe_histogram!(
        "vault_poll_cycle_duration_seconds",
        "Wall time of a published metrics cycle."
    );
    describe_gauge!("vault_total_tvl_usd", "Total value locked across all tracked vaults.");
    describe_gauge!("vault_pools_tracked", "Number of pools in the loaded registry.");
    describe_histogram!(
        "vault_multicall_batch_size",
        "Number of unique calls per multicall batch."
    );
    describe_counter!(
        "vault_feed_refresh_total",
        "Price/APY feed refresh attempts by feed and result."
    );
}

/// Installs the Prometheus exporter on `listen_addr` (e.g. `0.0.0.0:9000`).
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(listen_addr: &str) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn increment_cycle(outcome: &'static str) {
    counter!("vault_poll_cycles_total", 1, "outcome" => outcome);
}

pub fn record_cycle_duration(duration: Duration) {
    histogram!("vault_poll_cycle_duration_seconds", duration.as_secs_f64());
}

pub fn set_total_tvl(tvl: f64) {
    gauge!("vault_total_tvl_usd", tvl);
}

pub fn set_pools_tracked(count: usize) {
    gauge!("vault_pools_tracked", count as f64);
}

pub fn record_multicall_batch_size(network: &str, size: usize) {
    histogram!("vault_multicall_batch_size", size as f64, "network" => network.to_string());
}

pub fn increment_feed_refresh(feed: &'static str, result: &'static str) {
    counter!("vault_feed_refresh_total", 1, "feed" => feed, "result" => result);
}
