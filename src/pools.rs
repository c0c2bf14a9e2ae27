// src/pools.rs

use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Static definition of a single vault, as shipped in a network's pool config file.
///
/// Field names follow the camelCase keys used by the config files (`oracleId`,
/// `earnedTokenAddress`, `tokenDecimals`, ...). `assets` is required; a file whose entries
/// lack it fails to deserialize and the registry load is aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub assets: Vec<String>,
    #[serde(default)]
    pub platform: Option<String>,
    pub oracle_id: String,
    pub earned_token_address: Address,
    pub token_decimals: u8,
    /// Unix seconds
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub risk_score: Option<f64>,
}

/// Contents of `<pool_config_dir>/<network>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPoolConfig {
    pub pools: Vec<PoolConfig>,
}

/// Stable-asset exposure of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultType {
    /// Single underlying asset
    Single,
    /// Every asset is a recognized stable
    Stable,
    /// Some, but not all, assets are stables
    Stables,
    /// No stable exposure
    Volatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolTag {
    Stable,
    Recent,
    Low,
}

/// A vault tracked by the dashboard: static definition plus the metrics refreshed each poll cycle.
///
/// Records are created once when the registry is loaded and then mutated in place by the
/// aggregator; the list itself is never rebuilt during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: String,
    pub name: Option<String>,
    pub network: String,
    pub platform: Option<String>,
    pub oracle_id: String,
    pub earned_token_address: Address,
    pub token_decimals: u8,
    pub assets: Vec<String>,
    pub created_at: Option<i64>,
    pub risk_score: Option<f64>,
    pub vault_type: VaultType,
    pub tags: Vec<PoolTag>,

    // Metrics
    /// Connected wallet's deposit and balance; no wallet is read here, so these stay zero
    pub deposited: Decimal,
    pub balance: Decimal,
    /// Vault-wide `balance()` normalized by token decimals
    pub vault_balance: Decimal,
    pub daily: f64,
    pub apy: f64,
    pub apy_available: bool,
    pub tvl: Decimal,
    pub last_updated: Option<DateTime<Utc>>,
}

impl PoolRecord {
    /// Builds a record with zeroed metrics. Classification is applied by the registry loader.
    pub fn from_config(config: PoolConfig, network: &str) -> Self {
        Self {
            id: config.id,
            name: config.name,
            network: network.to_string(),
            platform: config.platform,
            oracle_id: config.oracle_id,
            earned_token_address: config.earned_token_address,
            token_decimals: config.token_decimals,
            assets: config.assets,
            created_at: config.created_at,
            risk_score: config.risk_score,
            vault_type: VaultType::Volatile,
            tags: Vec::new(),
            deposited: Decimal::ZERO,
            balance: Decimal::ZERO,
            vault_balance: Decimal::ZERO,
            daily: 0.0,
            apy: 0.0,
            apy_available: false,
            tvl: Decimal::ZERO,
            last_updated: None,
        }
    }

    pub fn has_tag(&self, tag: PoolTag) -> bool {
        self.tags.contains(&tag)
    }
}
