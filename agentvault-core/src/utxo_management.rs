//! Local UTXO ledger
//!
//! The ledger is the wallet's own view of spendable value. Providers are
//! trusted for which outputs exist, but lock state is local: an output
//! reserved for an in-flight spend stays reserved across refreshes, and an
//! output consumed by a broadcast transaction stays locked (owner = txid)
//! until the provider stops reporting it.
//!
//! # Security Considerations
//!
//! - Selection and locking happen under one mutex acquisition, so two spends
//!   can never reserve the same output
//! - An empty provider answer never wipes a non-empty cache; a flaky
//!   provider must not make funds look spent
//! - The cache file is rewritten whole, owner-only (0600)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agentvault_common::error::WalletResult;
use agentvault_common::logging::{log_core, log_storage, LogLevel};
use agentvault_common::math::calculate_fee;
use agentvault_common::storage;
use agentvault_common::version::STATE_FORMAT_VERSION;

use crate::gateway::{ChainProvider, ProviderUtxo};
use crate::utxo_selection::{CoinSelector, Selection};
use crate::{files, lock_or_recover};

/// Dust outputs needed before consolidation is worth suggesting
pub const MIN_DUST_FOR_CONSOLIDATION: usize = 10;

/// An output owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
    /// Hex output script when the provider supplied it
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub locked: bool,
    /// Reservation id while a spend is being built, txid once broadcast
    #[serde(default)]
    pub lock_owner: Option<String>,
    /// Change recorded locally and not yet reported by any provider
    #[serde(default)]
    pub optimistic: bool,
}

impl UnspentOutput {
    pub fn new(txid: &str, vout: u32, address: &str, amount: u64, confirmations: u32) -> Self {
        Self {
            txid: txid.to_string(),
            vout,
            address: address.to_string(),
            amount,
            script: None,
            confirmations,
            locked: false,
            lock_owner: None,
            optimistic: false,
        }
    }

    fn from_provider(utxo: ProviderUtxo, address: &str) -> Self {
        Self {
            script: Some(utxo.script).filter(|s| !s.is_empty()),
            ..Self::new(&utxo.txid, utxo.vout, address, utxo.amount, utxo.confirmations)
        }
    }

    pub fn same_outpoint(&self, txid: &str, vout: u32) -> bool {
        self.txid == txid && self.vout == vout
    }

    fn lock_for(&mut self, owner: &str) {
        self.locked = true;
        self.lock_owner = Some(owner.to_string());
    }

    fn release(&mut self) {
        self.locked = false;
        self.lock_owner = None;
    }
}

/// Totals reported by [`UtxoLedger::balance`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerBalance {
    /// Sum of unlocked outputs
    pub spendable: u64,
    pub locked: u64,
    /// Unlocked outputs with zero confirmations (included in `spendable`)
    pub unconfirmed: u64,
    pub utxo_count: usize,
}

impl LedgerBalance {
    pub fn total(&self) -> u64 {
        self.spendable + self.locked
    }
}

/// Outcome of a refresh
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Outputs the ledger had never seen before
    pub received: Vec<UnspentOutput>,
    pub removed: usize,
    /// True when an empty provider answer was ignored
    pub kept_cache: bool,
}

/// Why consolidation is being suggested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationReason {
    TooManyOutputs,
    DustAccumulation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsolidationAdvice {
    pub reason: ConsolidationReason,
    pub utxo_count: usize,
    pub dust_count: usize,
    pub dust_total: u64,
    /// Fee of sweeping every spendable output into one
    pub estimated_fee: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerDocument {
    version: u32,
    address: Option<String>,
    utxos: Vec<UnspentOutput>,
    last_refreshed: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    address: Option<String>,
    utxos: Vec<UnspentOutput>,
    last_refreshed: Option<DateTime<Utc>>,
}

impl LedgerInner {
    fn find_mut(&mut self, txid: &str, vout: u32) -> Option<&mut UnspentOutput> {
        self.utxos.iter_mut().find(|u| u.same_outpoint(txid, vout))
    }
}

pub struct UtxoLedger {
    path: PathBuf,
    selector: CoinSelector,
    inner: Mutex<LedgerInner>,
}

impl UtxoLedger {
    /// Load the cached ledger from `data_dir`, or start empty
    pub fn open(data_dir: &Path, selector: CoinSelector) -> WalletResult<Self> {
        let path = data_dir.join(files::UTXO_CACHE);
        let inner = match storage::read_json::<LedgerDocument>(&path)? {
            Some(doc) => {
                log_storage(
                    LogLevel::Debug,
                    "utxo cache loaded",
                    Some(json!({"count": doc.utxos.len()})),
                );
                LedgerInner {
                    address: doc.address,
                    utxos: doc.utxos,
                    last_refreshed: doc.last_refreshed,
                }
            }
            None => LedgerInner::default(),
        };

        Ok(Self {
            path,
            selector,
            inner: Mutex::new(inner),
        })
    }

    pub fn selector(&self) -> &CoinSelector {
        &self.selector
    }

    fn persist(&self, inner: &LedgerInner) -> WalletResult<()> {
        let doc = LedgerDocument {
            version: STATE_FORMAT_VERSION,
            address: inner.address.clone(),
            utxos: inner.utxos.clone(),
            last_refreshed: inner.last_refreshed,
        };
        storage::write_json_private(&self.path, &doc)
    }

    /// Pull outputs for `address` and merge them into the ledger
    ///
    /// The provider call happens outside the ledger lock.
    pub fn refresh(&self, provider: &dyn ChainProvider, address: &str) -> WalletResult<RefreshReport> {
        let fetched = provider.get_utxos(address)?;
        let mut report = RefreshReport::default();

        let mut inner = lock_or_recover(&self.inner);
        if inner.address.as_deref() != Some(address) {
            // Cache belonged to another wallet (e.g. before a recover)
            inner.utxos.clear();
            inner.address = Some(address.to_string());
        }

        if fetched.is_empty() && !inner.utxos.is_empty() {
            log_core(
                LogLevel::Warn,
                "provider returned no outputs; keeping cached ledger",
                Some(json!({"cached": inner.utxos.len()})),
            );
            report.kept_cache = true;
            return Ok(report);
        }

        let seen: HashSet<(String, u32)> = fetched.iter().map(|u| (u.txid.clone(), u.vout)).collect();

        for remote in fetched {
            match inner.find_mut(&remote.txid, remote.vout) {
                Some(local) => {
                    local.confirmations = remote.confirmations;
                    local.amount = remote.amount;
                    local.optimistic = false;
                    if local.script.is_none() && !remote.script.is_empty() {
                        local.script = Some(remote.script);
                    }
                }
                None => {
                    let utxo = UnspentOutput::from_provider(remote, address);
                    report.received.push(utxo.clone());
                    inner.utxos.push(utxo);
                }
            }
        }

        // Anything the provider no longer reports is spent, except change it has not seen yet
        let before = inner.utxos.len();
        inner
            .utxos
            .retain(|u| u.optimistic || seen.contains(&(u.txid.clone(), u.vout)));
        report.removed = before - inner.utxos.len();

        inner.last_refreshed = Some(Utc::now());
        self.persist(&inner)?;

        log_core(
            LogLevel::Debug,
            "ledger refreshed",
            Some(json!({
                "received": report.received.len(),
                "removed": report.removed,
                "total": inner.utxos.len(),
            })),
        );
        Ok(report)
    }

    /// Insert an output unless one with the same (txid, vout) exists
    pub fn add_utxo(&self, utxo: UnspentOutput) -> WalletResult<bool> {
        let mut inner = lock_or_recover(&self.inner);
        if inner.find_mut(&utxo.txid, utxo.vout).is_some() {
            return Ok(false);
        }
        inner.utxos.push(utxo);
        self.persist(&inner)?;
        Ok(true)
    }

    /// Select inputs for `target` and lock them for `owner` in one step
    pub fn select_and_lock(
        &self,
        target: u64,
        fee_rate: u64,
        min_confirmations: u32,
        owner: &str,
    ) -> WalletResult<Selection> {
        let mut inner = lock_or_recover(&self.inner);

        let candidates: Vec<UnspentOutput> = inner
            .utxos
            .iter()
            .filter(|u| !u.locked && u.confirmations >= min_confirmations)
            .cloned()
            .collect();
        let selection = self.selector.select(&candidates, target, fee_rate)?;

        for input in &selection.inputs {
            if let Some(u) = inner.find_mut(&input.txid, input.vout) {
                u.lock_for(owner);
            }
        }

        if let Err(e) = self.persist(&inner) {
            for input in &selection.inputs {
                if let Some(u) = inner.find_mut(&input.txid, input.vout) {
                    u.release();
                }
            }
            return Err(e);
        }

        log_core(
            LogLevel::Debug,
            "inputs reserved",
            Some(json!({"owner": owner, "inputs": selection.inputs.len(), "fee": selection.fee})),
        );
        Ok(selection)
    }

    /// Release every output locked by `owner`; returns how many were released
    pub fn unlock(&self, owner: &str) -> WalletResult<usize> {
        let mut inner = lock_or_recover(&self.inner);
        let mut released = 0;
        for u in inner.utxos.iter_mut().filter(|u| u.lock_owner.as_deref() == Some(owner)) {
            u.release();
            released += 1;
        }
        if released > 0 {
            self.persist(&inner)?;
        }
        Ok(released)
    }

    /// Move locks from a reservation id to a txid
    pub fn reassign_lock(&self, from: &str, to: &str) -> WalletResult<usize> {
        let mut inner = lock_or_recover(&self.inner);
        let mut moved = 0;
        for u in inner.utxos.iter_mut().filter(|u| u.lock_owner.as_deref() == Some(from)) {
            u.lock_owner = Some(to.to_string());
            moved += 1;
        }
        if moved > 0 {
            self.persist(&inner)?;
        }
        Ok(moved)
    }

    /// Record a broadcast: inputs stay locked by `txid`, change is added optimistically
    pub fn mark_spent(&self, txid: &str, change: Option<UnspentOutput>) -> WalletResult<()> {
        let mut inner = lock_or_recover(&self.inner);
        for u in inner.utxos.iter_mut().filter(|u| u.lock_owner.as_deref() == Some(txid)) {
            u.locked = true;
        }
        if let Some(mut change) = change {
            if inner.find_mut(&change.txid, change.vout).is_none() {
                change.optimistic = true;
                change.release();
                inner.utxos.push(change);
            }
        }
        self.persist(&inner)
    }

    /// Undo [`mark_spent`](Self::mark_spent) for a transaction that will never confirm
    pub fn release_failed(&self, txid: &str) -> WalletResult<usize> {
        let mut inner = lock_or_recover(&self.inner);
        let mut released = 0;
        for u in inner.utxos.iter_mut().filter(|u| u.lock_owner.as_deref() == Some(txid)) {
            u.release();
            released += 1;
        }
        let before = inner.utxos.len();
        inner.utxos.retain(|u| !(u.optimistic && u.txid == txid));
        let dropped = before - inner.utxos.len();

        if released > 0 || dropped > 0 {
            self.persist(&inner)?;
            log_core(
                LogLevel::Info,
                "failed transaction released",
                Some(json!({"txid": txid, "inputs": released, "change_dropped": dropped})),
            );
        }
        Ok(released)
    }

    pub fn spendable_balance(&self) -> u64 {
        lock_or_recover(&self.inner)
            .utxos
            .iter()
            .filter(|u| !u.locked)
            .map(|u| u.amount)
            .sum()
    }

    pub fn balance(&self) -> LedgerBalance {
        let inner = lock_or_recover(&self.inner);
        let mut balance = LedgerBalance {
            utxo_count: inner.utxos.len(),
            ..LedgerBalance::default()
        };
        for u in &inner.utxos {
            if u.locked {
                balance.locked += u.amount;
            } else {
                balance.spendable += u.amount;
                if u.confirmations == 0 {
                    balance.unconfirmed += u.amount;
                }
            }
        }
        balance
    }

    pub fn utxos(&self) -> Vec<UnspentOutput> {
        lock_or_recover(&self.inner).utxos.clone()
    }

    pub fn locked_by(&self, owner: &str) -> Vec<UnspentOutput> {
        lock_or_recover(&self.inner)
            .utxos
            .iter()
            .filter(|u| u.lock_owner.as_deref() == Some(owner))
            .cloned()
            .collect()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        lock_or_recover(&self.inner).last_refreshed
    }

    /// Suggest sweeping outputs together when the set is fragmented
    pub fn consolidation_advice(&self, fee_rate: u64, threshold: usize) -> Option<ConsolidationAdvice> {
        let inner = lock_or_recover(&self.inner);
        let spendable: Vec<&UnspentOutput> = inner.utxos.iter().filter(|u| !u.locked).collect();
        let dust: Vec<&&UnspentOutput> = spendable
            .iter()
            .filter(|u| u.amount < self.selector.dust_threshold())
            .collect();
        let dust_total: u64 = dust.iter().map(|u| u.amount).sum();

        let reason = if spendable.len() > threshold {
            ConsolidationReason::TooManyOutputs
        } else if dust.len() >= MIN_DUST_FOR_CONSOLIDATION
            && dust_total > 2 * calculate_fee(dust.len(), 1, fee_rate)
        {
            ConsolidationReason::DustAccumulation
        } else {
            return None;
        };

        Some(ConsolidationAdvice {
            reason,
            utxo_count: spendable.len(),
            dust_count: dust.len(),
            dust_total,
            estimated_fee: calculate_fee(spendable.len(), 1, fee_rate),
        })
    }
}
