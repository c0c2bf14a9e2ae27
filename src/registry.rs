//! Pool registry: loads every network's static pool definitions once, classifies them and
//! collects the platform names shown by the dashboard filters.

use crate::pools::{NetworkPoolConfig, PoolConfig, PoolRecord, PoolTag, VaultType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("pool config for network '{network}' not found at {path}")]
    MissingNetworkConfig { network: String, path: String },
    #[error("failed to read pool config for network '{network}': {source}")]
    Read {
        network: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed pool config for network '{network}': {source}")]
    Malformed {
        network: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Provider of a network's static pool definitions.
#[async_trait]
pub trait PoolConfigSource: Send + Sync {
    async fn load_network(&self, network: &str) -> Result<NetworkPoolConfig, RegistryError>;
}

/// Reads `<dir>/<network>.json`.
pub struct FilePoolConfigSource {
    dir: PathBuf,
}

impl FilePoolConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PoolConfigSource for FilePoolConfigSource {
    async fn load_network(&self, network: &str) -> Result<NetworkPoolConfig, RegistryError> {
        let path = self.dir.join(format!("{}.json", network));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::MissingNetworkConfig {
                    network: network.to_string(),
                    path: path.display().to_string(),
                });
            }
            Err(source) => {
                return Err(RegistryError::Read {
                    network: network.to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| RegistryError::Malformed {
            network: network.to_string(),
            source,
        })
    }
}

/// Case-insensitive set of platform names. The first spelling seen is kept for display.
#[derive(Debug, Clone, Default)]
pub struct PlatformSet {
    names: IndexMap<String, String>,
}

impl PlatformSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the name was not already present (ignoring case).
    pub fn insert(&mut self, name: &str) -> bool {
        let key = name.to_lowercase();
        if self.names.contains_key(&key) {
            return false;
        }
        self.names.insert(key, name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.values().map(String::as_str)
    }
}

/// The loaded registry: every pool across all networks plus the platform set.
#[derive(Debug, Clone)]
pub struct Registry {
    pub pools: Vec<PoolRecord>,
    pub platforms: PlatformSet,
}

/// A configured network and the asset symbols it treats as stables.
#[derive(Debug, Clone)]
pub struct NetworkProfile {
    pub id: String,
    pub stable_assets: HashSet<String>,
}

/// Thresholds used when tagging pools.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRules {
    pub recent_window: Duration,
    pub low_risk_threshold: f64,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            recent_window: Duration::days(3),
            low_risk_threshold: 2.5,
        }
    }
}

/// Classifies a pool by stable exposure and computes its tag set.
pub fn classify_pool(
    config: &PoolConfig,
    stable_assets: &HashSet<String>,
    rules: &ClassificationRules,
    now: DateTime<Utc>,
) -> (VaultType, Vec<PoolTag>) {
    let mut tags = Vec::new();

    let vault_type = match config.assets.len() {
        0 => VaultType::Volatile,
        1 => VaultType::Single,
        _ => {
            let stable_count = config
                .assets
                .iter()
                .filter(|asset| stable_assets.contains(*asset))
                .count();
            if stable_count == config.assets.len() {
                tags.push(PoolTag::Stable);
                VaultType::Stable
            } else if stable_count > 0 {
                VaultType::Stables
            } else {
                VaultType::Volatile
            }
        }
    };

    if let Some(created_at) = config.created_at {
        match DateTime::<Utc>::from_timestamp(created_at, 0) {
            Some(created) if created > now - rules.recent_window => tags.push(PoolTag::Recent),
            Some(_) => {}
            None => warn!("Pool {} has out-of-range createdAt {}", config.id, created_at),
        }
    }

    if let Some(score) = config.risk_score {
        if score < rules.low_risk_threshold {
            tags.push(PoolTag::Low);
        }
    }

    (vault_type, tags)
}

/// Loads the registry once and hands out the same instance afterwards.
pub struct PoolRegistryLoader {
    source: Arc<dyn PoolConfigSource>,
    networks: Vec<NetworkProfile>,
    rules: ClassificationRules,
    cached: OnceCell<Arc<Registry>>,
}

impl PoolRegistryLoader {
    pub fn new(
        source: Arc<dyn PoolConfigSource>,
        networks: Vec<NetworkProfile>,
        rules: ClassificationRules,
    ) -> Self {
        Self {
            source,
            networks,
            rules,
            cached: OnceCell::new(),
        }
    }

    /// Returns the cached registry, loading it on first use.
    ///
    /// A failed load leaves the cache empty, so a later call will try again.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<Arc<Registry>, RegistryError> {
        self.cached
            .get_or_try_init(|| async { self.fetch_all(now).await.map(Arc::new) })
            .await
            .cloned()
    }

    pub fn cached(&self) -> Option<Arc<Registry>> {
        self.cached.get().cloned()
    }

    pub fn networks(&self) -> &[NetworkProfile] {
        &self.networks
    }

    async fn fetch_all(&self, now: DateTime<Utc>) -> Result<Registry, RegistryError> {
        let loads = self
            .networks
            .iter()
            .map(|network| self.source.load_network(&network.id));
        let configs = futures::future::try_join_all(loads).await?;

        let mut pools = Vec::new();
        let mut platforms = PlatformSet::new();

        for (network, config) in self.networks.iter().zip(configs) {
            debug!("Loaded {} pools for {}", config.pools.len(), network.id);
            for pool_config in config.pools {
                if let Some(platform) = pool_config.platform.as_deref() {
                    if !platform.is_empty() {
                        platforms.insert(platform);
                    }
                }

                let (vault_type, tags) =
                    classify_pool(&pool_config, &network.stable_assets, &self.rules, now);
                let mut record = PoolRecord::from_config(pool_config, &network.id);
                record.vault_type = vault_type;
                record.tags = tags;
                pools.push(record);
            }
        }

        info!(
            "📚 Pool registry loaded: {} pools across {} networks, {} platforms",
            pools.len(),
            self.networks.len(),
            platforms.len()
        );

        Ok(Registry { pools, platforms })
    }
}
