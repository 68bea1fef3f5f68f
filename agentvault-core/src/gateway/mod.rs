//! Chain data providers and failover routing
//!
//! Everything the wallet learns about the chain (balances, unspent outputs,
//! transaction status, fee rates) and every broadcast goes through the
//! [`ChainProvider`] trait. [`FailoverGateway`] implements the same trait
//! over an ordered list of providers so callers never see which one served
//! a request.

use serde::{Deserialize, Serialize};

use agentvault_common::error::WalletResult;
use agentvault_common::types::FeeSpeed;

pub mod blockcypher;
pub mod failover;
pub mod mock;

pub use blockcypher::BlockCypherProvider;
pub use failover::{FailoverGateway, ProviderHealth};
pub use mock::MockProvider;

/// An unspent output as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUtxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
    /// Hex output script; may be empty when the provider omits it
    pub script: String,
    pub confirmations: u32,
}

/// Confirmation status of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub txid: String,
    pub confirmations: u32,
    pub block_height: Option<u64>,
}

/// Condensed history entry for an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSummary {
    pub txid: String,
    pub confirmations: u32,
    /// Net effect on the address in minor units
    pub net_amount: i64,
}

/// Fee rates in minor units per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl FeeRates {
    pub fn for_speed(&self, speed: FeeSpeed) -> u64 {
        match speed {
            FeeSpeed::Low => self.low,
            FeeSpeed::Medium => self.medium,
            FeeSpeed::High => self.high,
        }
    }
}

/// Chain tip and fee estimates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub height: u64,
    pub fees: FeeRates,
}

/// Source of chain data and broadcast endpoint
///
/// Implementations must be usable from several threads at once: the
/// background refresh and confirmation jobs share one gateway with the
/// command surface.
pub trait ChainProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Confirmed plus unconfirmed balance in minor units
    fn get_balance(&self, address: &str) -> WalletResult<u64>;

    fn get_utxos(&self, address: &str) -> WalletResult<Vec<ProviderUtxo>>;

    /// `Ok(None)` when the provider has never seen the transaction
    fn get_transaction(&self, txid: &str) -> WalletResult<Option<TxStatus>>;

    fn get_transactions(&self, address: &str, limit: usize) -> WalletResult<Vec<TxSummary>>;

    /// Submit a signed transaction, returning the txid the provider reports
    fn broadcast_tx(&self, raw_hex: &str) -> WalletResult<String>;

    fn get_network_info(&self) -> WalletResult<NetworkInfo>;
}
