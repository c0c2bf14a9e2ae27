//! Poll scheduler: drives "load registry → read balances → aggregate → publish" with a
//! minimum interval between published cycles and a fixed-delay retry while data is missing.
//!
//! ```text
//! Idle → LoadingRegistry → FetchingMetrics → Published
//!                               ↑    │
//!                               └ Waiting (no connection / no prices yet)
//! ```
//!
//! The scheduler owns its [`VaultState`], so only one cycle can be in flight. All timing goes
//! through `tokio::time`, which lets tests run on the paused clock.

use crate::aggregator::{apply_metrics, Aggregation};
use crate::contract_reader::{read_balances, ConnectionRegistry};
use crate::feeds::SharedFeedCache;
use crate::metrics;
use crate::pools::PoolRecord;
use crate::publisher::{AggregateSnapshot, Publisher};
use crate::registry::{PlatformSet, PoolRegistryLoader, RegistryError};
use crate::settings::Settings;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Minimum time between two published cycles
    pub min_interval: Duration,
    /// Delay before retrying a cycle that could not run yet
    pub retry_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&Settings> for PollerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            min_interval: Duration::from_secs(settings.poller.min_interval_seconds),
            retry_delay: Duration::from_millis(settings.poller.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    LoadingRegistry,
    FetchingMetrics,
    Published,
    Waiting,
}

/// Why a cycle could not run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    NoConnections,
    PricesUnavailable,
}

impl NotReadyReason {
    fn as_str(self) -> &'static str {
        match self {
            NotReadyReason::NoConnections => "no_connections",
            NotReadyReason::PricesUnavailable => "prices_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A snapshot was published after `retries` not-ready attempts.
    Published { total_tvl: Decimal, retries: u32 },
    /// The previous publish is younger than the minimum interval; nothing was done.
    TooSoon,
}

enum Attempt {
    Published(Decimal),
    NotReady(NotReadyReason),
}

/// Pool list and totals as last published.
#[derive(Debug, Clone, Default)]
pub struct VaultState {
    pub pools: Vec<PoolRecord>,
    pub platforms: PlatformSet,
    pub total_tvl: Decimal,
    pub is_loading: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct PollScheduler {
    loader: Arc<PoolRegistryLoader>,
    connections: Arc<ConnectionRegistry>,
    feeds: SharedFeedCache,
    publisher: Publisher,
    config: PollerConfig,
    state: VaultState,
    phase: SchedulerState,
    last_published: Option<Instant>,
}

impl PollScheduler {
    pub fn new(
        loader: Arc<PoolRegistryLoader>,
        connections: Arc<ConnectionRegistry>,
        feeds: SharedFeedCache,
        publisher: Publisher,
        config: PollerConfig,
    ) -> Self {
        Self {
            loader,
            connections,
            feeds,
            publisher,
            config,
            state: VaultState {
                is_loading: true,
                ..VaultState::default()
            },
            phase: SchedulerState::Idle,
            last_published: None,
        }
    }

    pub fn state(&self) -> &VaultState {
        &self.state
    }

    pub fn phase(&self) -> SchedulerState {
        self.phase
    }

    pub fn config(&self) -> PollerConfig {
        self.config
    }

    /// Loads the registry (cached after the first success) into the scheduler state.
    ///
    /// Pools already in the state are kept as they are so their metrics survive.
    pub async fn load_registry(&mut self) -> Result<(), RegistryError> {
        self.phase = SchedulerState::LoadingRegistry;
        let registry = match self.loader.load(Utc::now()).await {
            Ok(registry) => registry,
            Err(e) => {
                self.phase = SchedulerState::Idle;
                return Err(e);
            }
        };
        if self.state.pools.is_empty() {
            self.state.pools = registry.pools.clone();
            self.state.platforms = registry.platforms.clone();
            metrics::set_pools_tracked(self.state.pools.len());
        }
        Ok(())
    }

    /// Explicit trigger: publishes "loading", loads the registry, publishes the pool list and
    /// platforms, then runs a metrics cycle.
    pub async fn fetch_pools(&mut self, is_loading: bool) -> Result<CycleOutcome> {
        self.publisher.begin_loading();
        self.load_registry().await?;
        self.publish_pools(is_loading);
        self.fetch_pools_data().await
    }

    /// Runs a metrics cycle, retrying every `retry_delay` until it can publish.
    ///
    /// Returns [`CycleOutcome::TooSoon`] without doing anything when the last publish is
    /// younger than `min_interval`. Batch read failures abort the cycle and are returned.
    pub async fn fetch_pools_data(&mut self) -> Result<CycleOutcome> {
        let mut retries = 0u32;
        loop {
            if self.too_soon() {
                debug!("Metrics cycle skipped: too soon");
                metrics::increment_cycle("too_soon");
                return Ok(CycleOutcome::TooSoon);
            }

            self.phase = SchedulerState::FetchingMetrics;
            match self.attempt_cycle().await {
                Ok(Attempt::Published(total_tvl)) => {
                    return Ok(CycleOutcome::Published { total_tvl, retries });
                }
                Ok(Attempt::NotReady(reason)) => {
                    self.phase = SchedulerState::Waiting;
                    metrics::increment_cycle(reason.as_str());
                    retries += 1;
                    debug!(
                        "Metrics cycle not ready ({:?}), retry #{} in {:?}",
                        reason, retries, self.config.retry_delay
                    );
                    sleep(self.config.retry_delay).await;
                }
                Err(e) => {
                    self.phase = SchedulerState::Idle;
                    metrics::increment_cycle("failed");
                    return Err(e);
                }
            }
        }
    }

    /// Long-running driver: one cycle every `min_interval` until `shutdown` flips to `true`
    /// (or its sender is dropped). Registry load failure is fatal; cycle failures are logged
    /// and retried after `retry_delay`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "🚀 Starting poll scheduler (min interval {:?}, retry delay {:?})",
            self.config.min_interval, self.config.retry_delay
        );

        self.publisher.begin_loading();
        self.load_registry().await?;
        self.publish_pools(true);

        let mut next_at = Instant::now();
        loop {
            let stop = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => true,
                _ = sleep_until(next_at) => false,
            };
            if stop {
                break;
            }

            let result = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => None,
                res = self.fetch_pools_data() => Some(res),
            };

            match result {
                None => break,
                Some(Ok(CycleOutcome::Published { total_tvl, retries })) => {
                    debug!("Cycle published (TVL {}, {} retries)", total_tvl, retries);
                    next_at = self.next_cycle_at();
                }
                Some(Ok(CycleOutcome::TooSoon)) => {
                    next_at = self.next_cycle_at();
                }
                Some(Err(e)) => {
                    warn!("❌ Metrics cycle failed: {:#}", e);
                    next_at = Instant::now() + self.config.retry_delay;
                }
            }
        }

        info!("🛑 Poll scheduler stopped");
        self.phase = SchedulerState::Idle;
        Ok(())
    }

    fn too_soon(&self) -> bool {
        self.last_published
            .map(|at| at.elapsed() < self.config.min_interval)
            .unwrap_or(false)
    }

    fn next_cycle_at(&self) -> Instant {
        self.last_published
            .map(|at| at + self.config.min_interval)
            .unwrap_or_else(Instant::now)
    }

    fn publish_pools(&self, is_loading: bool) {
        self.publisher.pools_available(
            self.state.pools.clone(),
            self.state.platforms.iter().map(str::to_string).collect(),
            is_loading,
        );
    }

    async fn attempt_cycle(&mut self) -> Result<Attempt> {
        let connections = self.connections.snapshot();
        if connections.is_empty() {
            return Ok(Attempt::NotReady(NotReadyReason::NoConnections));
        }

        let prices = self.feeds.prices();
        if prices.is_empty() {
            return Ok(Attempt::NotReady(NotReadyReason::PricesUnavailable));
        }
        let apy = self.feeds.apy();

        info!(
            "🔄 Fetching metrics for {} pools ({} networks connected, {} prices)",
            self.state.pools.len(),
            connections.len(),
            prices.len()
        );
        let started = Instant::now();

        let balances = read_balances(&connections, &self.state.pools).await?;
        let now = Utc::now();

        match apply_metrics(&mut self.state.pools, &balances, &prices, &apy, now) {
            Aggregation::NotReady => Ok(Attempt::NotReady(NotReadyReason::PricesUnavailable)),
            Aggregation::Applied { total_tvl, matched } => {
                self.state.total_tvl = total_tvl;
                self.state.is_loading = false;
                self.state.last_updated = Some(now);

                self.publisher.metrics_available(AggregateSnapshot {
                    pools: self.state.pools.clone(),
                    total_tvl,
                    is_loading: false,
                    last_updated: now,
                });
                self.last_published = Some(Instant::now());
                self.phase = SchedulerState::Published;

                let elapsed = started.elapsed();
                metrics::increment_cycle("published");
                metrics::record_cycle_duration(elapsed);
                metrics::set_total_tvl(total_tvl.to_f64().unwrap_or(0.0));
                info!(
                    "✅ Metrics published: {}/{} pools updated, total TVL ${} in {:?}",
                    matched,
                    self.state.pools.len(),
                    total_tvl.round_dp(2),
                    elapsed
                );
                Ok(Attempt::Published(total_tvl))
            }
        }
    }
}

/// Resolves once the shutdown flag is `true` or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_reader::tests::MockCaller;
    use crate::pools::{NetworkPoolConfig, PoolConfig};
    use crate::publisher::VaultEvent;
    use crate::registry::tests::InMemorySource;
    use crate::registry::{ClassificationRules, NetworkProfile};
    use ethers::types::{Address, U256};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        scheduler: PollScheduler,
        caller: Arc<MockCaller>,
        connections: Arc<ConnectionRegistry>,
        feeds: SharedFeedCache,
        publisher: Publisher,
        events: UnboundedReceiver<VaultEvent>,
    }

    fn pool_config(id: &str, address: Address) -> PoolConfig {
        PoolConfig {
            id: id.to_string(),
            name: None,
            assets: vec!["USDC".to_string(), "BNB".to_string()],
            platform: Some("Venus".to_string()),
            oracle_id: format!("{}-oracle", id),
            earned_token_address: address,
            token_decimals: 6,
            created_at: None,
            risk_score: None,
        }
    }

    /// Two pools on network "A", each holding 1_000_000 raw units (1.0 token).
    fn harness(connected: bool, caller: MockCaller) -> Harness {
        let source = Arc::new(InMemorySource {
            configs: HashMap::from([(
                "A".to_string(),
                NetworkPoolConfig {
                    pools: vec![
                        pool_config("p1", Address::repeat_byte(1)),
                        pool_config("p2", Address::repeat_byte(2)),
                    ],
                },
            )]),
            loads: AtomicUsize::new(0),
        });
        let loader = Arc::new(PoolRegistryLoader::new(
            source,
            vec![NetworkProfile {
                id: "A".to_string(),
                stable_assets: HashSet::from(["USDC".to_string()]),
            }],
            ClassificationRules::default(),
        ));

        let caller = Arc::new(caller);
        let connections = Arc::new(ConnectionRegistry::new());
        if connected {
            connections.connect("A", caller.clone());
        }
        let feeds = SharedFeedCache::new();
        let (publisher, events) = Publisher::new();

        let scheduler = PollScheduler::new(
            loader,
            connections.clone(),
            feeds.clone(),
            publisher.clone(),
            PollerConfig::default(),
        );

        Harness {
            scheduler,
            caller,
            connections,
            feeds,
            publisher,
            events,
        }
    }

    fn funded_caller() -> MockCaller {
        MockCaller::new(HashMap::from([
            (Address::repeat_byte(1), U256::from(1_000_000u64)),
            (Address::repeat_byte(2), U256::from(1_000_000u64)),
        ]))
    }

    fn one_price() -> HashMap<String, f64> {
        HashMap::from([("p1-oracle".to_string(), 2.5)])
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_with_partial_prices() {
        let mut h = harness(true, funded_caller());
        h.feeds.update_prices(one_price());

        let outcome = h.scheduler.fetch_pools(true).await.unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::Published {
                total_tvl: Decimal::new(25, 1),
                retries: 0
            }
        );
        let state = h.scheduler.state();
        assert_eq!(state.pools[0].tvl, Decimal::new(25, 1));
        assert_eq!(state.pools[1].tvl, Decimal::ZERO);
        assert_eq!(state.total_tvl, state.pools.iter().map(|p| p.tvl).sum::<Decimal>());
        assert!(state.last_updated.is_some());
        assert!(!state.is_loading);
        assert_eq!(h.caller.batches(), 1);
        assert_eq!(h.scheduler.phase(), SchedulerState::Published);

        assert!(matches!(h.events.try_recv(), Ok(VaultEvent::PoolsLoading)));
        match h.events.try_recv() {
            Ok(VaultEvent::PoolsAvailable { pools, platforms, is_loading }) => {
                assert_eq!(pools.len(), 2);
                assert_eq!(platforms, vec!["Venus".to_string()]);
                assert!(is_loading);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match h.events.try_recv() {
            Ok(VaultEvent::MetricsAvailable(snapshot)) => {
                assert_eq!(snapshot.total_tvl, Decimal::new(25, 1));
                assert!(!snapshot.is_loading);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_within_interval_is_too_soon() {
        let mut h = harness(true, funded_caller());
        h.feeds.update_prices(one_price());

        assert!(matches!(
            h.scheduler.fetch_pools(true).await.unwrap(),
            CycleOutcome::Published { .. }
        ));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(h.scheduler.fetch_pools_data().await.unwrap(), CycleOutcome::TooSoon);
        assert_eq!(h.caller.batches(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            h.scheduler.fetch_pools_data().await.unwrap(),
            CycleOutcome::Published { .. }
        ));
        assert_eq!(h.caller.batches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_prices_arrive() {
        let mut h = harness(true, funded_caller());
        let feeds = h.feeds.clone();

        let (outcome, _) = tokio::join!(h.scheduler.fetch_pools(true), async move {
            sleep(Duration::from_millis(2500)).await;
            feeds.update_prices(one_price());
        });

        assert_eq!(
            outcome.unwrap(),
            CycleOutcome::Published {
                total_tvl: Decimal::new(25, 1),
                retries: 3
            }
        );
        // Balances are only read once prices exist
        assert_eq!(h.caller.batches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_a_network_connects() {
        let mut h = harness(false, funded_caller());
        h.feeds.update_prices(one_price());
        let connections = h.connections.clone();
        let caller = h.caller.clone();

        let (outcome, _) = tokio::join!(h.scheduler.fetch_pools_data(), async move {
            sleep(Duration::from_millis(1500)).await;
            connections.connect("A", caller);
        });

        assert!(matches!(
            outcome.unwrap(),
            CycleOutcome::Published { retries: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_aborts_cycle() {
        let mut h = harness(true, MockCaller::failing());
        h.feeds.update_prices(one_price());

        assert!(h.scheduler.fetch_pools(true).await.is_err());
        assert_eq!(h.scheduler.phase(), SchedulerState::Idle);
        assert!(h.scheduler.state().pools.iter().all(|p| p.tvl.is_zero()));
        assert!(h.scheduler.state().last_updated.is_none());
        assert!(h.publisher.latest().is_none());

        // A failed cycle does not arm the rate limit
        assert!(h.scheduler.fetch_pools_data().await.is_err());
        assert_eq!(h.caller.batches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_loaded_once_and_pools_kept() {
        let mut h = harness(true, funded_caller());
        h.feeds.update_prices(one_price());

        h.scheduler.fetch_pools(true).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        h.scheduler.fetch_pools(false).await.unwrap();

        // Metrics from the previous cycle were not reset by the second registry load
        assert_eq!(h.scheduler.state().pools.len(), 2);
        assert_eq!(h.scheduler.state().pools[0].tvl, Decimal::new(25, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval_until_shutdown() {
        let h = harness(true, funded_caller());
        h.feeds.update_prices(one_price());
        let caller = h.caller.clone();
        let publisher = h.publisher.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.run(shutdown_rx));

        sleep(Duration::from_secs(130)).await;
        assert_eq!(caller.batches(), 3);
        assert!(publisher.latest().is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ignores_false_shutdown_signal() {
        let h = harness(true, funded_caller());
        let feeds = h.feeds.clone();
        let caller = h.caller.clone();
        let publisher = h.publisher.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.run(shutdown_rx));

        // The first cycle is waiting for prices when `false` is sent
        sleep(Duration::from_millis(1500)).await;
        shutdown_tx.send(false).unwrap();
        sleep(Duration::from_secs(1)).await;
        feeds.update_prices(one_price());
        sleep(Duration::from_secs(2)).await;

        assert!(!handle.is_finished());
        assert_eq!(caller.batches(), 1);
        assert!(publisher.latest().is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
