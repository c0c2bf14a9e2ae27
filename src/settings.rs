use crate::registry::{ClassificationRules, NetworkProfile};
use anyhow::{Context, Result};
use config::{Config, ConfigError, File};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::Path;
use url::Url;

/// Canonical Multicall3 deployment, identical on most EVM networks.
pub const DEFAULT_MULTICALL_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

fn default_true() -> bool {
    true
}

fn default_multicall_address() -> String {
    DEFAULT_MULTICALL_ADDRESS.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    pub rpc_url: String,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: String,
    /// Asset symbols treated as stables when classifying this network's pools
    #[serde(default)]
    pub stable_assets: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl NetworkSettings {
    pub fn multicall_address(&self) -> Result<Address> {
        self.multicall_address
            .trim()
            .parse::<Address>()
            .with_context(|| format!("invalid multicall address '{}'", self.multicall_address))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Poller {
    #[serde(default = "default_min_interval_seconds")]
    pub min_interval_seconds: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_min_interval_seconds() -> u64 {
    60
}
fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            min_interval_seconds: default_min_interval_seconds(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Registry {
    #[serde(default = "default_pool_config_dir")]
    pub pool_config_dir: String,
    #[serde(default = "default_recent_days")]
    pub recent_days: i64,
    #[serde(default = "default_low_risk_threshold")]
    pub low_risk_threshold: f64,
}

fn default_pool_config_dir() -> String {
    "config/pools".to_string()
}
fn default_recent_days() -> i64 {
    3
}
fn default_low_risk_threshold() -> f64 {
    2.5
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            pool_config_dir: default_pool_config_dir(),
            recent_days: default_recent_days(),
            low_risk_threshold: default_low_risk_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Feeds {
    /// JSON object oracle id → USD price. Without it no cycle can publish.
    #[serde(default)]
    pub prices_url: Option<String>,
    /// JSON object pool id → APY fraction
    #[serde(default)]
    pub apy_url: Option<String>,
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_refresh_interval_seconds() -> u64 {
    60
}
fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for Feeds {
    fn default() -> Self {
        Self {
            prices_url: None,
            apy_url: None,
            refresh_interval_seconds: default_refresh_interval_seconds(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Observability {
    /// e.g. "0.0.0.0:9100"; only used with the `observability` feature
    #[serde(default)]
    pub metrics_listen_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSettings>,
    #[serde(default)]
    pub poller: Poller,
    #[serde(default)]
    pub registry: Registry,
    #[serde(default)]
    pub feeds: Feeds,
    #[serde(default)]
    pub observability: Observability,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// `VAULT_RPC_URLS` (JSON object network → URL), `VAULT_FEEDS_PRICES_URL`,
    /// `VAULT_FEEDS_APY_URL`. Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("VAULT_RPC_URLS") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                match serde_json::from_str::<HashMap<String, String>>(trimmed) {
                    Ok(map) => {
                        for (network, url) in map {
                            if url.trim().is_empty() {
                                continue;
                            }
                            match self.networks.get_mut(&network) {
                                Some(existing) => existing.rpc_url = url,
                                None => {
                                    self.networks.insert(
                                        network,
                                        NetworkSettings {
                                            rpc_url: url,
                                            multicall_address: default_multicall_address(),
                                            stable_assets: Vec::new(),
                                            enabled: true,
                                        },
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => {
                        eprintln!("Failed to parse VAULT_RPC_URLS as JSON: {}", e);
                    }
                }
            }
        }

        if let Some(url) = non_empty_env("VAULT_FEEDS_PRICES_URL") {
            self.feeds.prices_url = Some(url);
        }
        if let Some(url) = non_empty_env("VAULT_FEEDS_APY_URL") {
            self.feeds.apy_url = Some(url);
        }
    }

    /// Checks URLs and addresses of enabled networks and feeds.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_networks().next().is_none() {
            anyhow::bail!("no enabled networks configured");
        }
        for (id, network) in self.enabled_networks() {
            validate_http_url(&network.rpc_url)
                .with_context(|| format!("network '{}' rpc_url", id))?;
            network
                .multicall_address()
                .with_context(|| format!("network '{}'", id))?;
        }
        if let Some(url) = &self.feeds.prices_url {
            validate_http_url(url).context("feeds.prices_url")?;
        }
        if let Some(url) = &self.feeds.apy_url {
            validate_http_url(url).context("feeds.apy_url")?;
        }
        if self.poller.retry_delay_ms == 0 {
            anyhow::bail!("poller.retry_delay_ms must be greater than zero");
        }
        if self.feeds.refresh_interval_seconds == 0 {
            anyhow::bail!("feeds.refresh_interval_seconds must be greater than zero");
        }
        if self.registry.recent_days < 0 {
            anyhow::bail!("registry.recent_days must not be negative");
        }
        Ok(())
    }

    pub fn enabled_networks(&self) -> impl Iterator<Item = (&String, &NetworkSettings)> {
        self.networks.iter().filter(|(_, network)| network.enabled)
    }

    /// Enabled networks in id order, as consumed by the registry loader.
    pub fn network_profiles(&self) -> Vec<NetworkProfile> {
        self.enabled_networks()
            .map(|(id, network)| NetworkProfile {
                id: id.clone(),
                stable_assets: network.stable_assets.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn classification_rules(&self) -> ClassificationRules {
        ClassificationRules {
            recent_window: chrono::Duration::days(self.registry.recent_days),
            low_risk_threshold: self.registry.low_risk_threshold,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid URL '{}'", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => anyhow::bail!("unsupported URL scheme '{}' in '{}'", other, raw),
    }
}
