use crate::metrics;
pub use anyhow::Result;
use async_trait::async_trait;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use log::debug;
use std::sync::Arc;

/// A single contract read to be batched in a multicall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Target contract address
    pub target: Address,
    /// Encoded function call data
    pub call_data: Bytes,
}

/// Anything that can execute a list of reads as one batched round trip.
///
/// Results come back in call order. `None` marks an individual read that reverted
/// inside an otherwise successful batch; a failed batch is an `Err`.
#[async_trait]
pub trait BatchCaller: Send + Sync {
    async fn aggregate(&self, calls: Vec<Call>) -> Result<Vec<Option<Bytes>>>;
}

/// Multicall3 client for one network.
///
/// Bundles every call handed to [`BatchCaller::aggregate`] into a single `aggregate3`
/// `eth_call` against the network's aggregator contract. Identical calls are coalesced
/// before submission and fanned back out afterwards.
///
/// ## Example
///
/// ```rust,ignore
/// let multicall = Multicall::new(provider, multicall_address);
/// let calls = vec![Call { target: vault_address, call_data: balance_call }];
/// let results = multicall.aggregate(calls).await?;
/// ```
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
    network: String,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address) -> Self {
        Self {
            provider,
            multicall_address,
            network: String::new(),
        }
    }

    /// Label used for logs and metrics.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn address(&self) -> Address {
        self.multicall_address
    }

    /// Runs a batch of calls, optionally at a specific block.
    pub async fn run(&self, calls: Vec<Call>, block: Option<BlockId>) -> Result<Vec<Option<Bytes>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls to reduce load
        let mut unique_calls = indexmap::IndexSet::new();
        let mut original_indices = Vec::with_capacity(calls.len());
        for call in &calls {
            let (index, _) = unique_calls.insert_full(call.clone());
            original_indices.push(index);
        }
        let unique_calls: Vec<Call> = unique_calls.into_iter().collect();
        debug!(
            "[{}] Multicall coalesced {} calls into {}",
            self.network,
            calls.len(),
            unique_calls.len()
        );

        metrics::record_multicall_batch_size(&self.network, unique_calls.len());

        let calldata = encode_aggregate3(&unique_calls)?;
        let tx_request = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata);
        let typed_tx: ethers::types::transaction::eip2718::TypedTransaction = tx_request.into();
        let response = self
            .provider
            .call(&typed_tx, block)
            .await
            .map_err(|e| anyhow::anyhow!("multicall on {} failed: {}", self.network, e))?;

        let unique_results = decode_aggregate3(&response)?;
        if unique_results.len() != unique_calls.len() {
            anyhow::bail!(
                "multicall on {} returned {} results for {} calls",
                self.network,
                unique_results.len(),
                unique_calls.len()
            );
        }

        // Reconstruct the full result set in the original order
        Ok(original_indices
            .into_iter()
            .map(|index| unique_results[index].clone())
            .collect())
    }
}

#[async_trait]
impl<M: Middleware + 'static> BatchCaller for Multicall<M> {
    async fn aggregate(&self, calls: Vec<Call>) -> Result<Vec<Option<Bytes>>> {
        self.run(calls, None).await
    }
}

fn call3_tuple() -> ParamType {
    ParamType::Tuple(vec![ParamType::Address, ParamType::Bool, ParamType::Bytes])
}

fn result_tuple() -> ParamType {
    ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes])
}

#[allow(deprecated)]
fn aggregate3_function() -> Function {
    // function aggregate3(Call3[] calldata calls) public payable returns (Result[] memory returnData)
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(call3_tuple())),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: ParamType::Array(Box::new(result_tuple())),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

/// ABI-encodes `aggregate3` with `allowFailure = true` on every call.
pub fn encode_aggregate3(calls: &[Call]) -> Result<Bytes> {
    let call_tokens = calls
        .iter()
        .map(|call| {
            Token::Tuple(vec![
                Token::Address(call.target),
                Token::Bool(true),
                Token::Bytes(call.call_data.to_vec()),
            ])
        })
        .collect();
    let encoded = aggregate3_function().encode_input(&[Token::Array(call_tokens)])?;
    Ok(Bytes::from(encoded))
}

/// Decodes the `(bool success, bytes returnData)[]` returned by `aggregate3`.
pub fn decode_aggregate3(response: &[u8]) -> Result<Vec<Option<Bytes>>> {
    let decoded = ethers::abi::decode(&[ParamType::Array(Box::new(result_tuple()))], response)?;

    let results_array = decoded
        .into_iter()
        .next()
        .and_then(|t| t.into_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid multicall response format"))?;

    let mut return_data = Vec::with_capacity(results_array.len());
    for result_token in results_array {
        match result_token {
            Token::Tuple(tuple) => match (tuple.first(), tuple.get(1)) {
                (Some(Token::Bool(true)), Some(Token::Bytes(data))) => {
                    return_data.push(Some(Bytes::from(data.clone())))
                }
                (Some(Token::Bool(false)), _) => return_data.push(None),
                _ => anyhow::bail!("Invalid multicall result tuple"),
            },
            _ => anyhow::bail!("Invalid multicall result entry"),
        }
    }

    Ok(return_data)
}
