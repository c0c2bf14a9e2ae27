//! Publish interface consumed by the rendering layer.

use crate::pools::PoolRecord;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use log::debug;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of a successful metrics cycle.
///
/// `total_tvl` always equals the sum of `pools[*].tvl`.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub pools: Vec<PoolRecord>,
    pub total_tvl: Decimal,
    pub is_loading: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum VaultEvent {
    /// A fetch was triggered
    PoolsLoading,
    /// Registry is available; metrics may still be zero
    PoolsAvailable {
        pools: Vec<PoolRecord>,
        platforms: Vec<String>,
        is_loading: bool,
    },
    /// A metrics cycle completed
    MetricsAvailable(Arc<AggregateSnapshot>),
}

/// Sends [`VaultEvent`]s and keeps the latest snapshot readable without waiting on the channel.
#[derive(Clone)]
pub struct Publisher {
    event_tx: mpsc::UnboundedSender<VaultEvent>,
    latest: Arc<ArcSwapOption<AggregateSnapshot>>,
}

impl Publisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<VaultEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                event_tx,
                latest: Arc::new(ArcSwapOption::empty()),
            },
            event_rx,
        )
    }

    pub fn begin_loading(&self) {
        self.send(VaultEvent::PoolsLoading);
    }

    pub fn pools_available(&self, pools: Vec<PoolRecord>, platforms: Vec<String>, is_loading: bool) {
        self.send(VaultEvent::PoolsAvailable {
            pools,
            platforms,
            is_loading,
        });
    }

    pub fn metrics_available(&self, snapshot: AggregateSnapshot) -> Arc<AggregateSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.latest.store(Some(Arc::clone(&snapshot)));
        self.send(VaultEvent::MetricsAvailable(Arc::clone(&snapshot)));
        snapshot
    }

    /// Most recently published snapshot, `None` until the first cycle completes.
    pub fn latest(&self) -> Option<Arc<AggregateSnapshot>> {
        self.latest.load_full()
    }

    fn send(&self, event: VaultEvent) {
        // A dropped receiver only means nobody is rendering
        if self.event_tx.send(event).is_err() {
            debug!("No event subscriber, dropping vault event");
        }
    }
}
