//! Base58Check addresses for legacy script types
//!
//! Dogecoin-family chains reuse Bitcoin's script system with their own
//! version bytes, so addresses are encoded here from [`ChainParams`] rather
//! than through `bitcoin::Address`, whose network enum is Bitcoin-only.

use bitcoin::hashes::Hash;
use bitcoin::{base58, PubkeyHash, PublicKey, ScriptBuf, ScriptHash};

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::types::ChainParams;

/// Decoded payload of an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPayload {
    PubkeyHash(PubkeyHash),
    ScriptHash(ScriptHash),
}

impl AddressPayload {
    /// Output script that pays to this payload
    pub fn script_pubkey(&self) -> ScriptBuf {
        match self {
            AddressPayload::PubkeyHash(hash) => ScriptBuf::new_p2pkh(hash),
            AddressPayload::ScriptHash(hash) => ScriptBuf::new_p2sh(hash),
        }
    }
}

/// P2PKH address of a compressed public key
pub fn p2pkh_address(pubkey: &PublicKey, chain: &ChainParams) -> String {
    encode(chain.p2pkh_version, pubkey.pubkey_hash().as_byte_array())
}

fn encode(version: u8, hash: &[u8; 20]) -> String {
    let mut data = Vec::with_capacity(21);
    data.push(version);
    data.extend_from_slice(hash);
    base58::encode_check(&data)
}

/// Decode and check an address against the chain's version bytes
pub fn decode_address(address: &str, chain: &ChainParams) -> WalletResult<AddressPayload> {
    let data = base58::decode_check(address.trim())
        .map_err(|e| WalletError::InvalidAddress(format!("{}: {}", address, e)))?;

    if data.len() != 21 {
        return Err(WalletError::InvalidAddress(format!(
            "{}: unexpected payload length {}",
            address,
            data.len()
        )));
    }

    let version = data[0];
    let hash = &data[1..];
    if version == chain.p2pkh_version {
        let hash = PubkeyHash::from_slice(hash)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        Ok(AddressPayload::PubkeyHash(hash))
    } else if version == chain.p2sh_version {
        let hash = ScriptHash::from_slice(hash)
            .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        Ok(AddressPayload::ScriptHash(hash))
    } else {
        Err(WalletError::InvalidAddress(format!(
            "{}: version byte {:#04x} is not valid on {}",
            address, version, chain.network
        )))
    }
}

/// Output script for an address
pub fn script_for_address(address: &str, chain: &ChainParams) -> WalletResult<ScriptBuf> {
    Ok(decode_address(address, chain)?.script_pubkey())
}

pub fn is_valid_address(address: &str, chain: &ChainParams) -> bool {
    decode_address(address, chain).is_ok()
}
