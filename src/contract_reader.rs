//! Contract reader: one batched `balance()` read per connected network.

use crate::contracts::BalanceCall;
use crate::multicall::{BatchCaller, Call};
use crate::pools::PoolRecord;
use anyhow::Result;
use dashmap::DashMap;
use ethers::abi::AbiEncode;
use ethers::types::{Bytes, U256};
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// Raw vault balance tagged with the pool it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceResult {
    pub id: String,
    pub balance: U256,
}

/// Active batch clients keyed by network id. A missing entry means the network is not
/// reachable right now.
pub type NetworkConnections = HashMap<String, Arc<dyn BatchCaller>>;

/// Runtime-mutable connection map. Networks connect and disconnect independently; each poll
/// cycle works on a [`snapshot`](ConnectionRegistry::snapshot).
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<dyn BatchCaller>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, network: impl Into<String>, caller: Arc<dyn BatchCaller>) {
        let network = network.into();
        debug!("Network {} connected", network);
        self.connections.insert(network, caller);
    }

    pub fn disconnect(&self, network: &str) -> bool {
        self.connections.remove(network).is_some()
    }

    pub fn is_connected(&self, network: &str) -> bool {
        self.connections.contains_key(network)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn snapshot(&self) -> NetworkConnections {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

fn balance_call_data() -> Bytes {
    Bytes::from(BalanceCall.encode())
}

/// Decodes a `uint256` return value. Returns `None` for short or empty return data.
fn decode_balance(data: &[u8]) -> Option<U256> {
    if data.len() < 32 {
        return None;
    }
    Some(U256::from_big_endian(&data[..32]))
}

/// Reads every pool's vault balance, one batched request per connected network.
///
/// Pools on networks absent from `connections` are skipped silently. The per-network batches
/// are submitted concurrently and awaited together; if any batch fails the whole read fails.
/// Individual reads that revert inside a batch are logged and left out of the result.
pub async fn read_balances(
    connections: &NetworkConnections,
    pools: &[PoolRecord],
) -> Result<Vec<BalanceResult>> {
    let mut by_network: IndexMap<&str, Vec<&PoolRecord>> = IndexMap::new();
    for pool in pools {
        if connections.contains_key(&pool.network) {
            by_network.entry(pool.network.as_str()).or_default().push(pool);
        }
    }

    let call_data = balance_call_data();
    let batches = by_network.into_iter().filter_map(|(network, network_pools)| {
        let caller = connections.get(network)?;
        let calls: Vec<Call> = network_pools
            .iter()
            .map(|pool| Call {
                target: pool.earned_token_address,
                call_data: call_data.clone(),
            })
            .collect();
        let ids: Vec<String> = network_pools.iter().map(|pool| pool.id.clone()).collect();
        Some(async move {
            debug!("Reading {} vault balances on {}", calls.len(), network);
            let results = caller.aggregate(calls).await?;
            if results.len() != ids.len() {
                anyhow::bail!(
                    "batch on {} returned {} results for {} pools",
                    network,
                    results.len(),
                    ids.len()
                );
            }

            let mut balances = Vec::with_capacity(ids.len());
            for (id, result) in ids.into_iter().zip(results) {
                match result.as_deref().and_then(decode_balance) {
                    Some(balance) => balances.push(BalanceResult { id, balance }),
                    None => warn!("⚠️ balance() read failed for pool {} on {}", id, network),
                }
            }
            Ok::<_, anyhow::Error>(balances)
        })
    });

    let per_network = futures::future::try_join_all(batches).await?;
    Ok(per_network.into_iter().flatten().collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pools::PoolConfig;
    use async_trait::async_trait;
    use ethers::abi::Token;
    use ethers::types::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `balance()` reads from a fixed address → balance table.
    pub(crate) struct MockCaller {
        pub balances: HashMap<Address, U256>,
        pub batches: AtomicUsize,
        pub calls_seen: AtomicUsize,
        pub fail: bool,
    }

    impl MockCaller {
        pub(crate) fn new(balances: HashMap<Address, U256>) -> Self {
            Self {
                balances,
                batches: AtomicUsize::new(0),
                calls_seen: AtomicUsize::new(0),
                fail: false,
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(HashMap::new())
            }
        }

        pub(crate) fn batches(&self) -> usize {
            self.batches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchCaller for MockCaller {
        async fn aggregate(&self, calls: Vec<Call>) -> Result<Vec<Option<Bytes>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.calls_seen.fetch_add(calls.len(), Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("rpc unavailable");
            }
            Ok(calls
                .iter()
                .map(|call| {
                    self.balances
                        .get(&call.target)
                        .map(|b| Bytes::from(ethers::abi::encode(&[Token::Uint(*b)])))
                })
                .collect())
        }
    }

    pub(crate) fn record(id: &str, network: &str, address: Address, decimals: u8) -> PoolRecord {
        PoolRecord::from_config(
            PoolConfig {
                id: id.to_string(),
                name: None,
                assets: vec!["TOKEN".to_string()],
                platform: None,
                oracle_id: format!("{}-oracle", id),
                earned_token_address: address,
                token_decimals: decimals,
                created_at: None,
                risk_score: None,
            },
            network,
        )
    }

    #[test]
    fn test_balance_selector() {
        // keccak256("balance()")[..4]
        assert_eq!(balance_call_data().to_vec(), vec![0xb6, 0x9e, 0xf8, 0xa8]);
    }

    #[tokio::test]
    async fn test_one_batch_per_network() {
        let a1 = Address::repeat_byte(1);
        let a2 = Address::repeat_byte(2);
        let b1 = Address::repeat_byte(3);
        let caller_a = Arc::new(MockCaller::new(HashMap::from([
            (a1, U256::from(10u64)),
            (a2, U256::from(20u64)),
        ])));
        let caller_b = Arc::new(MockCaller::new(HashMap::from([(b1, U256::from(30u64))])));

        let mut connections: NetworkConnections = HashMap::new();
        connections.insert("bsc".into(), caller_a.clone());
        connections.insert("polygon".into(), caller_b.clone());

        let pools = vec![
            record("a1", "bsc", a1, 18),
            record("b1", "polygon", b1, 18),
            record("a2", "bsc", a2, 18),
        ];

        let mut balances = read_balances(&connections, &pools).await.unwrap();
        balances.sort_by(|x, y| x.id.cmp(&y.id));

        assert_eq!(caller_a.batches(), 1);
        assert_eq!(caller_b.batches(), 1);
        assert_eq!(
            balances,
            vec![
                BalanceResult { id: "a1".into(), balance: U256::from(10u64) },
                BalanceResult { id: "a2".into(), balance: U256::from(20u64) },
                BalanceResult { id: "b1".into(), balance: U256::from(30u64) },
            ]
        );
    }

    #[tokio::test]
    async fn test_unconnected_networks_are_skipped() {
        let a1 = Address::repeat_byte(1);
        let caller = Arc::new(MockCaller::new(HashMap::from([(a1, U256::from(5u64))])));
        let mut connections: NetworkConnections = HashMap::new();
        connections.insert("bsc".into(), caller.clone());

        let pools = vec![
            record("a1", "bsc", a1, 18),
            record("f1", "fantom", Address::repeat_byte(9), 18),
        ];
        let balances = read_balances(&connections, &pools).await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(caller.calls_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reverted_read_is_left_out() {
        let a1 = Address::repeat_byte(1);
        let caller = Arc::new(MockCaller::new(HashMap::from([(a1, U256::from(5u64))])));
        let mut connections: NetworkConnections = HashMap::new();
        connections.insert("bsc".into(), caller);

        let pools = vec![
            record("a1", "bsc", a1, 18),
            record("gone", "bsc", Address::repeat_byte(7), 18),
        ];
        let balances = read_balances(&connections, &pools).await.unwrap();
        assert_eq!(balances, vec![BalanceResult { id: "a1".into(), balance: U256::from(5u64) }]);
    }

    #[tokio::test]
    async fn test_batch_failure_propagates() {
        let mut connections: NetworkConnections = HashMap::new();
        connections.insert("bsc".into(), Arc::new(MockCaller::failing()));
        let pools = vec![record("a1", "bsc", Address::repeat_byte(1), 18)];
        assert!(read_balances(&connections, &pools).await.is_err());
    }

    #[test]
    fn test_connection_registry_snapshot() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        registry.connect("bsc", Arc::new(MockCaller::new(HashMap::new())));
        assert!(registry.is_connected("bsc"));
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.disconnect("bsc"));
        assert!(registry.snapshot().is_empty());
    }
}
