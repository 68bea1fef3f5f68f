//! Transaction pipeline: select, build, sign, broadcast, track
//!
//! # Reservation lifecycle
//!
//! 1. Inputs are selected and locked under a fresh reservation id
//! 2. The transaction is built and signed; any failure releases the reservation
//! 3. Locks move from the reservation id to the txid
//! 4. Broadcast; a terminal failure releases the txid's locks
//! 5. Inputs stay locked as spent, change is recorded optimistically and the
//!    transaction is handed to the confirmation tracker

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_transaction, LogLevel};
use agentvault_common::types::{ChainParams, FeeSpeed};

use crate::address::script_for_address;
use crate::gateway::{ChainProvider, FailoverGateway};
use crate::key_vault::KeyVault;
use crate::random_id;
use crate::utxo_management::{UnspentOutput, UtxoLedger};
use crate::utxo_selection::Selection;

pub mod broadcaster;
pub mod builder;
pub mod confirmation;
pub mod signer;

pub use broadcaster::{Broadcaster, RetryPolicy};
pub use builder::{build_transaction, UnsignedTransaction};
pub use confirmation::{ConfirmationTracker, StateChange, TrackedTransaction, TrackingSettings, TxState};
pub use signer::{sign_transaction, SignedTransaction};

/// Fee and selection knobs for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fee_speed: FeeSpeed,
    /// Used when no provider can report fee rates
    pub fallback_fee_rate: u64,
    /// Largest fee accepted, in minor units
    pub fee_ceiling: u64,
    pub min_confirmations: u32,
    pub retry: RetryPolicy,
}

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentTransaction {
    pub txid: String,
    pub recipient: String,
    pub amount: u64,
    pub fee: u64,
    pub change: u64,
    pub inputs: usize,
    pub size: usize,
}

pub struct TransactionPipeline {
    chain: ChainParams,
    vault: Arc<KeyVault>,
    ledger: Arc<UtxoLedger>,
    gateway: Arc<FailoverGateway>,
    tracker: Arc<ConfirmationTracker>,
    broadcaster: Broadcaster,
    settings: PipelineSettings,
}

impl TransactionPipeline {
    pub fn new(
        chain: ChainParams,
        vault: Arc<KeyVault>,
        ledger: Arc<UtxoLedger>,
        gateway: Arc<FailoverGateway>,
        tracker: Arc<ConfirmationTracker>,
        settings: PipelineSettings,
    ) -> Self {
        let broadcaster = Broadcaster::new(gateway.clone(), settings.retry);
        Self {
            chain,
            vault,
            ledger,
            gateway,
            tracker,
            broadcaster,
            settings,
        }
    }

    pub fn tracker(&self) -> &Arc<ConfirmationTracker> {
        &self.tracker
    }

    /// Fee rate for the configured speed, falling back when providers are down
    pub fn current_fee_rate(&self) -> u64 {
        match self.gateway.get_network_info() {
            Ok(info) => info.fees.for_speed(self.settings.fee_speed).max(1),
            Err(e) => {
                log_transaction(
                    LogLevel::Warn,
                    "fee estimate unavailable, using fallback rate",
                    Some(json!({"error": e.kind(), "rate": self.settings.fallback_fee_rate})),
                );
                self.settings.fallback_fee_rate
            }
        }
    }

    /// Pay `amount` minor units to `recipient`
    pub fn send(&self, recipient: &str, amount: u64) -> WalletResult<SentTransaction> {
        script_for_address(recipient, &self.chain)?;
        builder::check_amount(amount, &self.chain)?;
        let own_address = self.vault.address()?;
        if !self.vault.is_unlocked() {
            return Err(WalletError::WalletLocked);
        }

        let fee_rate = self.current_fee_rate();
        let reservation = random_id("res");
        let selection = self.ledger.select_and_lock(
            amount,
            fee_rate,
            self.settings.min_confirmations,
            &reservation,
        )?;

        let signed = match self.build_and_sign(&selection, recipient, &own_address) {
            Ok(signed) => signed,
            Err(e) => {
                self.release(&reservation);
                return Err(e);
            }
        };

        if let Err(e) = self.ledger.reassign_lock(&reservation, &signed.txid) {
            self.release(&reservation);
            return Err(e);
        }

        let txid = match self.broadcaster.broadcast(&signed) {
            Ok(txid) => txid,
            Err(e) => {
                self.release(&signed.txid);
                return Err(e);
            }
        };

        let change = (selection.change > 0).then(|| {
            let mut utxo = UnspentOutput::new(&txid, builder::CHANGE_VOUT, &own_address, selection.change, 0);
            utxo.script = signed
                .tx
                .output
                .get(builder::CHANGE_VOUT as usize)
                .map(|o| hex::encode(o.script_pubkey.as_bytes()));
            utxo
        });

        // The transaction is on the network: bookkeeping failures are logged, not returned
        if let Err(e) = self.ledger.mark_spent(&txid, change) {
            log_transaction(
                LogLevel::Error,
                "failed to record spent inputs",
                Some(json!({"txid": txid, "error": e.to_string()})),
            );
        }
        if let Err(e) = self.tracker.track(&txid, recipient, amount, selection.fee) {
            log_transaction(
                LogLevel::Error,
                "failed to start confirmation tracking",
                Some(json!({"txid": txid, "error": e.to_string()})),
            );
        }

        Ok(SentTransaction {
            txid,
            recipient: recipient.to_string(),
            amount,
            fee: selection.fee,
            change: selection.change,
            inputs: selection.inputs.len(),
            size: signed.size,
        })
    }

    fn build_and_sign(
        &self,
        selection: &Selection,
        recipient: &str,
        own_address: &str,
    ) -> WalletResult<SignedTransaction> {
        let unsigned = build_transaction(
            selection,
            recipient,
            own_address,
            &self.chain,
            self.settings.fee_ceiling,
        )?;
        let key = self.vault.get_private_key()?;
        sign_transaction(unsigned.tx, &unsigned.inputs, unsigned.fee, key, &self.chain)
    }

    fn release(&self, owner: &str) {
        if let Err(e) = self.ledger.unlock(owner) {
            log_transaction(
                LogLevel::Error,
                "failed to release reserved inputs",
                Some(json!({"owner": owner, "error": e.to_string()})),
            );
        }
    }
}
