//! Unsigned transaction construction
//!
//! Output order is fixed: the recipient is output 0 and change, when there
//! is any, is output 1. The ledger relies on that to record change
//! optimistically after broadcast.

use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::str::FromStr;

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::math::estimate_tx_size;
use agentvault_common::types::ChainParams;

use crate::address::script_for_address;
use crate::utxo_management::UnspentOutput;
use crate::utxo_selection::Selection;

pub const RECIPIENT_VOUT: u32 = 0;
pub const CHANGE_VOUT: u32 = 1;

/// Transaction ready for signing, with the inputs it spends
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub inputs: Vec<UnspentOutput>,
    pub amount: u64,
    pub fee: u64,
    pub change: u64,
    /// Size the fee was computed for
    pub estimated_size: u64,
}

/// Reject amounts the network would refuse to relay
pub fn check_amount(amount: u64, chain: &ChainParams) -> WalletResult<()> {
    if amount < chain.dust_threshold {
        return Err(WalletError::InvalidAmount(format!(
            "{} is below the dust threshold of {}",
            amount, chain.dust_threshold
        )));
    }
    Ok(())
}

/// Build the spend described by `selection`
///
/// # Errors
///
/// - `InvalidAmount` if the amount is dust or the selection does not balance
/// - `FeeTooHigh` if the fee exceeds `fee_ceiling`
/// - `InvalidAddress` for a recipient or change address on another network
pub fn build_transaction(
    selection: &Selection,
    recipient: &str,
    change_address: &str,
    chain: &ChainParams,
    fee_ceiling: u64,
) -> WalletResult<UnsignedTransaction> {
    let amount = selection.target;
    check_amount(amount, chain)?;

    if selection.fee > fee_ceiling {
        return Err(WalletError::FeeTooHigh {
            fee: selection.fee,
            ceiling: fee_ceiling,
        });
    }

    let spent = amount
        .checked_add(selection.fee)
        .and_then(|v| v.checked_add(selection.change))
        .ok_or_else(|| WalletError::InvalidAmount("amount overflow".into()))?;
    if spent != selection.input_total() {
        return Err(WalletError::InvalidAmount(format!(
            "inputs {} do not balance outputs and fee {}",
            selection.input_total(),
            spent
        )));
    }

    let mut output = vec![TxOut {
        value: amount,
        script_pubkey: script_for_address(recipient, chain)?,
    }];
    if selection.change > 0 {
        output.push(TxOut {
            value: selection.change,
            script_pubkey: script_for_address(change_address, chain)?,
        });
    }

    let input = selection
        .inputs
        .iter()
        .map(|u| {
            let txid = Txid::from_str(&u.txid)
                .map_err(|e| WalletError::InvalidAmount(format!("input {}: bad txid: {}", u.txid, e)))?;
            Ok(TxIn {
                previous_output: OutPoint::new(txid, u.vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
        })
        .collect::<WalletResult<Vec<_>>>()?;

    let tx = Transaction {
        version: 1,
        lock_time: LockTime::ZERO,
        input,
        output,
    };

    Ok(UnsignedTransaction {
        estimated_size: estimate_tx_size(tx.input.len(), tx.output.len()),
        tx,
        inputs: selection.inputs.clone(),
        amount,
        fee: selection.fee,
        change: selection.change,
    })
}
