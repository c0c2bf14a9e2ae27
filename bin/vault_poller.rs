//! # Vault Poller Service
//!
//! Long-running service that keeps vault TVL and APY metrics fresh.
//!
//! ## Overview
//!
//! This service:
//! - Loads the pool registry for every enabled network in `Config.toml`
//! - Connects one Multicall3 client per network
//! - Refreshes prices and APYs from the HTTP feeds in the background
//! - Publishes a metrics snapshot at most once per `poller.min_interval_seconds`
//! - Handles graceful shutdown on Ctrl+C
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin vault_poller -- --config Config.toml
//! cargo run --bin vault_poller -- --once
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use ethers::prelude::{Http, Provider};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use vault_pulse::{
    feeds::HttpFeedUpdater,
    metrics,
    multicall::Multicall,
    registry::FilePoolConfigSource,
    scheduler::CycleOutcome,
    ConnectionRegistry, PollScheduler, PollerConfig, PoolRegistryLoader, Publisher,
    SharedFeedCache, Settings, VaultEvent,
};

#[derive(Parser)]
#[command(name = "vault_poller")]
#[command(about = "Polls vault balances and publishes TVL/APY metrics", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "Config.toml")]
    config: String,

    /// Run a single cycle, print the snapshot as JSON and exit
    #[arg(long)]
    once: bool,
}

fn connect_networks(settings: &Settings, connections: &ConnectionRegistry) -> Result<()> {
    for (id, network) in settings.enabled_networks() {
        let provider = Provider::<Http>::try_from(network.rpc_url.as_str())
            .with_context(|| format!("failed to create provider for {}", id))?;
        let multicall =
            Multicall::new(Arc::new(provider), network.multicall_address()?).with_network(id.clone());
        info!("🔌 {} connected (multicall {:?})", id, multicall.address());
        connections.connect(id.clone(), Arc::new(multicall));
    }
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<VaultEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            VaultEvent::PoolsLoading => debug!("Pools loading"),
            VaultEvent::PoolsAvailable {
                pools, platforms, ..
            } => info!(
                "📦 {} pools available across {} platforms",
                pools.len(),
                platforms.len()
            ),
            VaultEvent::MetricsAvailable(snapshot) => info!(
                "📈 Snapshot at {}: total TVL ${}",
                snapshot.last_updated,
                snapshot.total_tvl.round_dp(2)
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    env_logger::init();
    let args = Args::parse();

    info!("🚀 Starting Vault Poller");

    // 1. Load settings
    let settings = Settings::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config))?;
    settings.validate()?;
    info!(
        "✅ Settings loaded: {} enabled networks",
        settings.enabled_networks().count()
    );

    // 2. Metrics exporter
    metrics::describe_metrics();
    #[cfg(feature = "observability")]
    if let Some(addr) = &settings.observability.metrics_listen_addr {
        metrics::install_prometheus_exporter(addr)?;
        info!("📊 Prometheus exporter listening on {}", addr);
    }

    // 3. Network connections
    let connections = Arc::new(ConnectionRegistry::new());
    connect_networks(&settings, &connections)?;

    // 4. Feeds
    let feeds = SharedFeedCache::new();
    let updater = match &settings.feeds.prices_url {
        Some(prices_url) => Some(Arc::new(HttpFeedUpdater::new(
            feeds.clone(),
            prices_url.clone(),
            settings.feeds.apy_url.clone(),
            Duration::from_secs(settings.feeds.refresh_interval_seconds),
            Duration::from_millis(settings.feeds.request_timeout_ms),
        )?)),
        None => {
            warn!("⚠️ No price feed configured, cycles will wait for prices");
            None
        }
    };

    // 5. Registry loader and scheduler
    let loader = Arc::new(PoolRegistryLoader::new(
        Arc::new(FilePoolConfigSource::new(&settings.registry.pool_config_dir)),
        settings.network_profiles(),
        settings.classification_rules(),
    ));
    let (publisher, events) = Publisher::new();
    let mut scheduler = PollScheduler::new(
        loader,
        connections,
        feeds,
        publisher.clone(),
        PollerConfig::from(&settings),
    );

    if args.once {
        let updater = updater.context("--once needs feeds.prices_url")?;
        let (prices, apy) = updater.refresh().await?;
        info!("✅ Feeds refreshed: {} prices, {} apy entries", prices, apy);

        tokio::select! {
            outcome = scheduler.fetch_pools(true) => {
                if let CycleOutcome::Published { total_tvl, .. } = outcome? {
                    info!("✅ Cycle published, total TVL ${}", total_tvl.round_dp(2));
                }
            }
            _ = signal::ctrl_c() => {
                info!("🛑 Interrupted before the first snapshot");
                return Ok(());
            }
        }

        if let Some(snapshot) = publisher.latest() {
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
        }
        return Ok(());
    }

    if let Some(updater) = updater {
        tokio::spawn(updater.start());
    }
    tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    info!("✅ Vault Poller running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received, stopping scheduler...");

    shutdown_tx.send(true).ok();
    scheduler_handle.await??;

    info!("✅ Vault Poller stopped");
    Ok(())
}
