//! Metric aggregation: correlates batched balances with pool records and computes TVL and APY.

use crate::contract_reader::BalanceResult;
use crate::normalization::{normalize_amount, usd_value};
use crate::pools::PoolRecord;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use log::{debug, warn};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Oracle id → USD price.
pub type PriceMap = HashMap<String, f64>;
/// Pool id → APY as a fraction (0.12 = 12%).
pub type ApyMap = HashMap<String, f64>;

const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// The price feed has not produced anything yet; nothing was touched.
    NotReady,
    Applied {
        /// Sum of every pool's TVL after this pass
        total_tvl: Decimal,
        /// Pools that had a balance in this batch
        matched: usize,
    },
}

impl Aggregation {
    pub fn is_ready(&self) -> bool {
        matches!(self, Aggregation::Applied { .. })
    }
}

/// Applies one cycle's balances, prices and APYs to the pool list in place.
///
/// Pools without a balance in `balances` (network not connected, read reverted) keep their
/// previous metrics; their TVL still counts towards the total so it always equals the sum
/// of the published pool TVLs. A pool whose oracle is missing from `prices` gets TVL 0.
///
/// Pool TVLs and the total saturate at `Decimal::MAX`. Once the total saturates it no
/// longer equals the sum of the pool TVLs; this is logged as a warning.
pub fn apply_metrics(
    pools: &mut [PoolRecord],
    balances: &[BalanceResult],
    prices: &PriceMap,
    apy: &ApyMap,
    now: DateTime<Utc>,
) -> Aggregation {
    if prices.is_empty() {
        return Aggregation::NotReady;
    }

    // First result wins if a pool id shows up twice
    let mut by_id: HashMap<&str, U256> = HashMap::with_capacity(balances.len());
    for result in balances {
        by_id.entry(result.id.as_str()).or_insert(result.balance);
    }

    let mut total_tvl = Decimal::ZERO;
    let mut matched = 0;
    let mut saturated = false;

    for pool in pools.iter_mut() {
        if let Some(balance) = by_id.get(pool.id.as_str()) {
            let price = prices.get(&pool.oracle_id).copied().unwrap_or(0.0);
            pool.vault_balance = normalize_amount(*balance, pool.token_decimals);
            pool.tvl = usd_value(*balance, pool.token_decimals, price);

            match apy.get(&pool.id) {
                Some(value) if value.is_finite() => {
                    pool.apy = *value;
                    pool.apy_available = true;
                }
                _ => {
                    pool.apy = 0.0;
                    pool.apy_available = false;
                }
            }
            pool.daily = pool.apy / DAYS_PER_YEAR;
            pool.last_updated = Some(now);
            matched += 1;
        }

        total_tvl = match total_tvl.checked_add(pool.tvl) {
            Some(sum) => sum,
            None => {
                saturated = true;
                Decimal::MAX
            }
        };
    }

    if saturated {
        warn!(
            "⚠️ Total TVL overflowed, reporting {} instead of the pool sum",
            Decimal::MAX
        );
    }

    debug!(
        "Applied metrics to {}/{} pools, total TVL {}",
        matched,
        pools.len(),
        total_tvl
    );

    Aggregation::Applied { total_tvl, matched }
}
