// Contracts Module - Read-only vault ABIs

pub mod vault;

pub use vault::{BalanceCall, IVault};
