//! Scriptable in-memory provider
//!
//! FOR TESTING PURPOSES ONLY: serves whatever state the test sets and can be
//! told to fail or rate limit a number of upcoming calls. Broadcasts are
//! decoded and recorded, and answered with the transaction's real txid.

use bitcoin::consensus::encode::deserialize;
use bitcoin::Transaction;
use std::collections::HashMap;
use std::sync::Mutex;

use agentvault_common::error::{WalletError, WalletResult};

use super::{ChainProvider, FeeRates, NetworkInfo, ProviderUtxo, TxStatus, TxSummary};
use crate::lock_or_recover;

#[derive(Debug, Clone)]
enum Scripted {
    Fail(String),
    RateLimit(Option<u64>),
}

#[derive(Debug, Default)]
struct MockState {
    balances: HashMap<String, u64>,
    utxos: HashMap<String, Vec<ProviderUtxo>>,
    transactions: HashMap<String, TxStatus>,
    history: HashMap<String, Vec<TxSummary>>,
    network: Option<NetworkInfo>,
    broadcasts: Vec<String>,
    broadcast_error: Option<String>,
    scripted: Vec<Scripted>,
    down: bool,
    calls: usize,
}

pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn set_balance(&self, address: &str, amount: u64) {
        lock_or_recover(&self.state).balances.insert(address.to_string(), amount);
    }

    pub fn set_utxos(&self, address: &str, utxos: Vec<ProviderUtxo>) {
        lock_or_recover(&self.state).utxos.insert(address.to_string(), utxos);
    }

    pub fn set_transaction(&self, status: TxStatus) {
        lock_or_recover(&self.state)
            .transactions
            .insert(status.txid.clone(), status);
    }

    pub fn remove_transaction(&self, txid: &str) {
        lock_or_recover(&self.state).transactions.remove(txid);
    }

    pub fn set_history(&self, address: &str, history: Vec<TxSummary>) {
        lock_or_recover(&self.state).history.insert(address.to_string(), history);
    }

    pub fn set_network_info(&self, info: NetworkInfo) {
        lock_or_recover(&self.state).network = Some(info);
    }

    /// Reject every broadcast with this message until cleared
    pub fn set_broadcast_error(&self, message: Option<&str>) {
        lock_or_recover(&self.state).broadcast_error = message.map(str::to_string);
    }

    /// Fail the next `count` calls with a provider error
    pub fn fail_next(&self, message: &str, count: usize) {
        let mut state = lock_or_recover(&self.state);
        for _ in 0..count {
            state.scripted.push(Scripted::Fail(message.to_string()));
        }
    }

    /// Answer the next call with HTTP 429
    pub fn rate_limit_next(&self, retry_after: Option<u64>) {
        lock_or_recover(&self.state).scripted.push(Scripted::RateLimit(retry_after));
    }

    /// Fail every call until set back to false
    pub fn set_down(&self, down: bool) {
        lock_or_recover(&self.state).down = down;
    }

    /// Raw transactions accepted so far
    pub fn broadcasts(&self) -> Vec<String> {
        lock_or_recover(&self.state).broadcasts.clone()
    }

    pub fn call_count(&self) -> usize {
        lock_or_recover(&self.state).calls
    }

    fn begin(&self) -> WalletResult<std::sync::MutexGuard<'_, MockState>> {
        let mut state = lock_or_recover(&self.state);
        state.calls += 1;

        if state.down {
            return Err(self.error(Some(503), "service unavailable"));
        }
        if !state.scripted.is_empty() {
            return Err(match state.scripted.remove(0) {
                Scripted::Fail(message) => self.error(Some(500), &message),
                Scripted::RateLimit(retry_after) => WalletError::RateLimited {
                    provider: self.name.clone(),
                    retry_after,
                },
            });
        }
        Ok(state)
    }

    fn error(&self, status: Option<u16>, message: &str) -> WalletError {
        WalletError::ProviderError {
            provider: self.name.clone(),
            status,
            message: message.to_string(),
        }
    }
}

impl ChainProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_balance(&self, address: &str) -> WalletResult<u64> {
        let state = self.begin()?;
        Ok(state.balances.get(address).copied().unwrap_or(0))
    }

    fn get_utxos(&self, address: &str) -> WalletResult<Vec<ProviderUtxo>> {
        let state = self.begin()?;
        Ok(state.utxos.get(address).cloned().unwrap_or_default())
    }

    fn get_transaction(&self, txid: &str) -> WalletResult<Option<TxStatus>> {
        let state = self.begin()?;
        Ok(state.transactions.get(txid).cloned())
    }

    fn get_transactions(&self, address: &str, limit: usize) -> WalletResult<Vec<TxSummary>> {
        let state = self.begin()?;
        Ok(state
            .history
            .get(address)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn broadcast_tx(&self, raw_hex: &str) -> WalletResult<String> {
        let mut state = self.begin()?;
        if let Some(message) = &state.broadcast_error {
            return Err(self.error(Some(400), message));
        }

        let bytes = hex::decode(raw_hex).map_err(|e| self.error(Some(400), &format!("bad hex: {}", e)))?;
        let tx: Transaction =
            deserialize(&bytes).map_err(|e| self.error(Some(400), &format!("bad transaction: {}", e)))?;
        let txid = tx.txid().to_string();

        state.broadcasts.push(raw_hex.to_string());
        state.transactions.insert(
            txid.clone(),
            TxStatus {
                txid: txid.clone(),
                confirmations: 0,
                block_height: None,
            },
        );
        Ok(txid)
    }

    fn get_network_info(&self) -> WalletResult<NetworkInfo> {
        let state = self.begin()?;
        Ok(state.network.clone().unwrap_or(NetworkInfo {
            height: 0,
            fees: FeeRates {
                low: 1_000,
                medium: 1_000,
                high: 2_000,
            },
        }))
    }
}
