//! Core domain types shared across the AgentVault workspace
//!
//! # Security Considerations
//!
//! - [`SecretBytes`] is the only container used for passphrases, recovery
//!   phrases and private keys. It is a mutable byte buffer that is zeroed
//!   when dropped, never an immutable string
//! - Debug and Display output of secret containers is always redacted
//! - Chain parameters are public data and may be logged freely

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

use crate::error::WalletError;

/// Byte buffer that holds sensitive data and is zeroed when dropped
///
/// # Examples
///
/// ```
/// use agentvault_common::types::SecretBytes;
///
/// let passphrase = SecretBytes::from_str_bytes("test-pass-12345");
/// assert_eq!(passphrase.len(), 15);
/// // passphrase is zeroed when it goes out of scope
/// ```
#[derive(Zeroize)]
pub struct SecretBytes {
    inner: Vec<u8>,
}

impl SecretBytes {
    /// Take ownership of the given bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: bytes.into(),
        }
    }

    /// Copy the UTF-8 bytes of a string slice into a new buffer
    ///
    /// The caller remains responsible for the original string.
    pub fn from_str_bytes(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }

    /// Get a reference to the inner bytes
    ///
    /// # Security
    ///
    /// The returned slice must not be persisted or logged.
    pub fn expose_secret(&self) -> &[u8] {
        &self.inner
    }

    /// Interpret the buffer as UTF-8 text, for APIs that only accept `&str`
    pub fn expose_str(&self) -> Result<&str, WalletError> {
        std::str::from_utf8(&self.inner)
            .map_err(|_| WalletError::Crypto("secret is not valid UTF-8".into()))
    }

    /// Zero the bytes and leave the buffer empty
    pub fn clear(&mut self) {
        self.inner.zeroize();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Produce an independent copy of the buffer
    ///
    /// Wiping the copy never affects the original and vice versa.
    pub fn duplicate(&self) -> Self {
        Self::new(self.inner.clone())
    }

    /// Sanitized representation for logging: only the length is revealed
    pub fn to_sanitized_string(&self) -> String {
        format!("<{} secret bytes>", self.inner.len())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.inner.len())
    }
}

impl fmt::Display for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<String> for SecretBytes {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

/// Supported coin networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoinNetwork {
    Dogecoin,
    DogecoinTestnet,
}

impl CoinNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinNetwork::Dogecoin => "dogecoin",
            CoinNetwork::DogecoinTestnet => "dogecoin-testnet",
        }
    }

    pub fn params(&self) -> ChainParams {
        match self {
            CoinNetwork::Dogecoin => ChainParams::dogecoin(),
            CoinNetwork::DogecoinTestnet => ChainParams::dogecoin_testnet(),
        }
    }
}

impl fmt::Display for CoinNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoinNetwork {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dogecoin" | "doge" | "mainnet" => Ok(CoinNetwork::Dogecoin),
            "dogecoin-testnet" | "doge-testnet" | "testnet" => Ok(CoinNetwork::DogecoinTestnet),
            other => Err(WalletError::Config(format!("unknown network: {}", other))),
        }
    }
}

/// Per-network constants used for addresses, derivation and fees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub network: CoinNetwork,
    /// Base58 version byte for pay-to-pubkey-hash addresses
    pub p2pkh_version: u8,
    /// Base58 version byte for pay-to-script-hash addresses
    pub p2sh_version: u8,
    /// BIP44 coin type (hardened)
    pub coin_type: u32,
    /// Smallest output value worth creating or spending, in minor units
    pub dust_threshold: u64,
    /// Fallback fee rate in minor units per byte
    pub default_fee_rate: u64,
    /// Minor units per whole coin
    pub minor_per_major: u64,
    /// Ticker shown at presentation time
    pub ticker: String,
}

impl ChainParams {
    pub fn dogecoin() -> Self {
        Self {
            network: CoinNetwork::Dogecoin,
            p2pkh_version: 0x1e,
            p2sh_version: 0x16,
            coin_type: 3,
            dust_threshold: 1_000_000,
            default_fee_rate: 1_000,
            minor_per_major: 100_000_000,
            ticker: "DOGE".to_string(),
        }
    }

    pub fn dogecoin_testnet() -> Self {
        Self {
            network: CoinNetwork::DogecoinTestnet,
            p2pkh_version: 0x71,
            p2sh_version: 0xc4,
            coin_type: 1,
            ..Self::dogecoin()
        }
    }

    /// BIP44 path of the single receiving key used by the wallet
    pub fn derivation_path(&self) -> String {
        format!("m/44'/{}'/0'/0/0", self.coin_type)
    }
}

/// Fee speed tiers reported by providers
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FeeSpeed {
    /// Several blocks
    Low,
    /// Within a few blocks
    Medium,
    /// Next block
    High,
}

impl fmt::Display for FeeSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeSpeed::Low => write!(f, "low"),
            FeeSpeed::Medium => write!(f, "medium"),
            FeeSpeed::High => write!(f, "high"),
        }
    }
}

impl FromStr for FeeSpeed {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "slow" => Ok(FeeSpeed::Low),
            "medium" | "normal" => Ok(FeeSpeed::Medium),
            "high" | "fast" => Ok(FeeSpeed::High),
            other => Err(WalletError::Config(format!("unknown fee speed: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bytes_debug_is_redacted() {
        let secret = SecretBytes::from_str_bytes("hunter2-hunter2");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn duplicate_is_independent() {
        let original = SecretBytes::new(vec![7u8; 32]);
        let mut copy = original.duplicate();
        copy.clear();
        assert!(copy.is_empty());
        assert_eq!(original.expose_secret(), &[7u8; 32]);
    }

    #[test]
    fn testnet_params_keep_mainnet_fee_constants() {
        let main = ChainParams::dogecoin();
        let test = ChainParams::dogecoin_testnet();
        assert_eq!(main.dust_threshold, test.dust_threshold);
        assert_ne!(main.p2pkh_version, test.p2pkh_version);
        assert_eq!(main.derivation_path(), "m/44'/3'/0'/0/0");
        assert_eq!(test.derivation_path(), "m/44'/1'/0'/0/0");
    }

    #[test]
    fn network_parses_aliases() {
        assert_eq!("DOGE".parse::<CoinNetwork>().unwrap(), CoinNetwork::Dogecoin);
        assert!("litecoin".parse::<CoinNetwork>().is_err());
    }
}
