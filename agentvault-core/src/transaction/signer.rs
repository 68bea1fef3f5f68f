//! Legacy P2PKH signing
//!
//! # Security Considerations
//!
//! - The private key arrives as a zeroizing copy and is converted into a
//!   `SecretKey` held by [`KeyGuard`], which erases it on every exit path
//! - Every input must pay to the wallet's own P2PKH script; anything else is
//!   refused before a signature is produced
//! - The finished transaction is re-verified input by input against freshly
//!   computed sighashes before it is handed to the broadcaster

use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::consensus::encode::serialize;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, Script, ScriptBuf, Transaction};
use serde_json::json;

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_transaction, LogLevel};
use agentvault_common::types::{ChainParams, SecretBytes};

use crate::address::{p2pkh_address, script_for_address};
use crate::utxo_management::UnspentOutput;

/// Holds a secp256k1 secret and erases it when dropped
struct KeyGuard(SecretKey);

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.0.non_secure_erase();
    }
}

/// A fully signed, verified transaction
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub txid: String,
    pub raw_hex: String,
    pub fee: u64,
    /// Serialized size in bytes
    pub size: usize,
    pub tx: Transaction,
}

fn signing_error(message: impl Into<String>) -> WalletError {
    WalletError::Signing(message.into())
}

/// Output script an input is locked by
fn input_script(input: &UnspentOutput, chain: &ChainParams) -> WalletResult<ScriptBuf> {
    match &input.script {
        Some(hex) => ScriptBuf::from_hex(hex)
            .map_err(|e| signing_error(format!("input {}:{} has a malformed script: {}", input.txid, input.vout, e))),
        // Providers may omit the script; rebuild it from the address
        None => script_for_address(&input.address, chain),
    }
}

fn sighash_message(tx: &Transaction, index: usize, script: &Script) -> WalletResult<Message> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
        .map_err(|e| signing_error(format!("sighash for input {}: {}", index, e)))?;
    Message::from_slice(&sighash.to_byte_array()).map_err(|e| signing_error(e.to_string()))
}

/// Sign every input of `tx` with `key`
pub fn sign_transaction(
    mut tx: Transaction,
    inputs: &[UnspentOutput],
    fee: u64,
    key: SecretBytes,
    chain: &ChainParams,
) -> WalletResult<SignedTransaction> {
    if tx.input.len() != inputs.len() {
        return Err(signing_error("input metadata does not match the transaction"));
    }

    let secp = Secp256k1::new();
    let guard = KeyGuard(
        SecretKey::from_slice(key.expose_secret()).map_err(|_| signing_error("private key is invalid"))?,
    );
    drop(key);

    let pubkey = PublicKey::new(guard.0.public_key(&secp));
    let own_address = p2pkh_address(&pubkey, chain);
    let own_script = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());

    let mut scripts = Vec::with_capacity(inputs.len());
    for input in inputs {
        let script = input_script(input, chain)?;
        if script != own_script || input.address != own_address {
            return Err(signing_error(format!(
                "input {}:{} is not owned by this wallet",
                input.txid, input.vout
            )));
        }
        scripts.push(script);
    }

    let mut script_sigs = Vec::with_capacity(inputs.len());
    for (index, script) in scripts.iter().enumerate() {
        let message = sighash_message(&tx, index, script)?;
        let sig = secp.sign_ecdsa(&message, &guard.0);
        let signature = ecdsa::Signature {
            sig,
            hash_ty: EcdsaSighashType::All,
        };
        let push = PushBytesBuf::try_from(signature.to_vec())
            .map_err(|_| signing_error("signature exceeds push limit"))?;
        script_sigs.push(Builder::new().push_slice(push).push_key(&pubkey).into_script());
    }
    drop(guard);

    for (txin, script_sig) in tx.input.iter_mut().zip(script_sigs) {
        txin.script_sig = script_sig;
    }

    verify_signatures(&secp, &tx, &scripts)?;

    let bytes = serialize(&tx);
    let signed = SignedTransaction {
        txid: tx.txid().to_string(),
        raw_hex: hex::encode(&bytes),
        fee,
        size: bytes.len(),
        tx,
    };

    log_transaction(
        LogLevel::Debug,
        "transaction signed",
        Some(json!({"txid": signed.txid, "inputs": inputs.len(), "size": signed.size})),
    );
    Ok(signed)
}

/// Check each input's `<sig> <pubkey>` against its recomputed sighash
pub fn verify_signatures(secp: &Secp256k1<All>, tx: &Transaction, scripts: &[ScriptBuf]) -> WalletResult<()> {
    for (index, (txin, script)) in tx.input.iter().zip(scripts).enumerate() {
        let mut pushes = Vec::with_capacity(2);
        for instruction in txin.script_sig.instructions() {
            match instruction {
                Ok(Instruction::PushBytes(bytes)) => pushes.push(bytes.as_bytes().to_vec()),
                _ => return Err(signing_error(format!("input {} has a malformed script_sig", index))),
            }
        }
        if pushes.len() != 2 {
            return Err(signing_error(format!("input {} is not a P2PKH spend", index)));
        }

        let signature = ecdsa::Signature::from_slice(&pushes[0])
            .map_err(|e| signing_error(format!("input {} signature: {}", index, e)))?;
        let pubkey = PublicKey::from_slice(&pushes[1])
            .map_err(|e| signing_error(format!("input {} public key: {}", index, e)))?;

        if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) != *script {
            return Err(signing_error(format!("input {} key does not match its script", index)));
        }

        let message = sighash_message(tx, index, script)?;
        secp.verify_ecdsa(&message, &signature.sig, &pubkey.inner)
            .map_err(|_| signing_error(format!("input {} signature does not verify", index)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::builder::build_transaction;
    use crate::utxo_selection::{Selection, SelectionStrategy};

    const KEY: [u8; 32] = [0x42; 32];

    fn own_address(chain: &ChainParams) -> String {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&KEY).unwrap();
        p2pkh_address(&PublicKey::new(secret.public_key(&secp)), chain)
    }

    fn unsigned(chain: &ChainParams, address: &str) -> (Transaction, Vec<UnspentOutput>) {
        let inputs = vec![
            UnspentOutput::new(&"11".repeat(32), 0, address, 300_000_000, 6),
            UnspentOutput::new(&"22".repeat(32), 1, address, 200_000_000, 6),
        ];
        let selection = Selection {
            inputs: inputs.clone(),
            target: 400_000_000,
            fee: 374_000,
            change: 99_626_000,
            strategy: SelectionStrategy::LargestFirst,
        };
        let built = build_transaction(&selection, address, address, chain, 10_000_000).unwrap();
        (built.tx, inputs)
    }

    #[test]
    fn signs_and_verifies_every_input() {
        let chain = ChainParams::dogecoin();
        let address = own_address(&chain);
        let (tx, inputs) = unsigned(&chain, &address);

        let signed = sign_transaction(tx, &inputs, 374_000, SecretBytes::new(KEY.to_vec()), &chain).unwrap();
        assert_eq!(signed.txid.len(), 64);
        assert_eq!(signed.raw_hex.len(), signed.size * 2);
        assert!(signed.tx.input.iter().all(|i| !i.script_sig.is_empty()));
    }

    #[test]
    fn foreign_inputs_are_refused() {
        let chain = ChainParams::dogecoin();
        let address = own_address(&chain);
        let (tx, mut inputs) = unsigned(&chain, &address);
        inputs[1].address = {
            let mut data = vec![chain.p2pkh_version];
            data.extend_from_slice(&[9u8; 20]);
            bitcoin::base58::encode_check(&data)
        };

        let err = sign_transaction(tx, &inputs, 374_000, SecretBytes::new(KEY.to_vec()), &chain).unwrap_err();
        assert!(matches!(err, WalletError::Signing(_)));
    }

    #[test]
    fn tampered_output_fails_verification() {
        let chain = ChainParams::dogecoin();
        let address = own_address(&chain);
        let (tx, inputs) = unsigned(&chain, &address);
        let mut signed = sign_transaction(tx, &inputs, 374_000, SecretBytes::new(KEY.to_vec()), &chain).unwrap();

        signed.tx.output[0].value += 1;
        let scripts: Vec<ScriptBuf> = inputs.iter().map(|i| input_script(i, &chain).unwrap()).collect();
        assert!(verify_signatures(&Secp256k1::new(), &signed.tx, &scripts).is_err());
    }
}
