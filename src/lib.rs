//! # Vault Pulse
//!
//! Polling and aggregation core for a multi-network yield vault dashboard.
//!
//! ## Overview
//!
//! Each poll cycle reads every vault's `balance()` through one Multicall3 batch per connected
//! network, normalizes the raw amounts by token decimals, prices them with the off-chain feed
//! and publishes per-pool TVL and APY plus the total TVL.
//!
//! ## Pipeline
//!
//! ### Registry
//! Static per-network pool definitions are loaded once, classified (`single`, `stable`,
//! `stables`, `volatile`) and tagged (`stable`, `recent`, `low`).
//!
//! ### Reading
//! [`contract_reader::read_balances`] groups pools by network and submits the batches
//! concurrently.
//!
//! ### Aggregation & Publishing
//! [`aggregator::apply_metrics`] correlates balances back to pools by id.
//! [`scheduler::PollScheduler`] enforces the minimum interval between publishes and retries
//! while connections or prices are missing.

// Data model
/// Pool configuration and runtime pool records
pub mod pools;
/// Load-once pool registry and classification
pub mod registry;

// On-chain reads
/// Vault contract ABI
pub mod contracts;
/// Multicall3 batching
pub mod multicall;
/// Per-network batched balance reads
pub mod contract_reader;
/// Token-decimal normalization
pub mod normalization;

// Aggregation
pub mod aggregator;
/// Price and APY feeds
pub mod feeds;
pub mod publisher;
/// Poll scheduler
pub mod scheduler;
pub mod stats;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use aggregator::{apply_metrics, Aggregation};
pub use contract_reader::{read_balances, ConnectionRegistry};
pub use feeds::SharedFeedCache;
pub use publisher::{AggregateSnapshot, Publisher, VaultEvent};
pub use registry::{PoolRegistryLoader, RegistryError};
pub use scheduler::{CycleOutcome, PollScheduler, PollerConfig};
pub use settings::Settings;
