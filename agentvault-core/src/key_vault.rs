//! Key vault: encrypted keystore, lock/unlock and auto-lock
//!
//! # Security Model
//!
//! The wallet holds exactly one signing key, derived from a 24-word BIP39
//! recovery phrase at the chain's BIP44 path. Only the 32-byte private key is
//! persisted, encrypted with AES-256-GCM under a key stretched from the
//! owner's passphrase with Argon2id. The recovery phrase is handed back once,
//! at creation, and never stored.
//!
//! ## Security Boundaries
//!
//! - **Disk**: the keystore never contains plaintext key material; the file
//!   is 0600 inside a 0700 directory
//! - **Memory**: the unlocked key lives in one zeroizing buffer. Callers get
//!   an independent copy from [`KeyVault::get_private_key`], so wiping their
//!   copy never corrupts the vault's
//! - **Time**: every key access re-arms a single-shot auto-lock countdown;
//!   when it expires the live buffer is zeroed
//!
//! ## Security Considerations
//!
//! - Passphrases and phrases are accepted as [`SecretBytes`] by value and
//!   wiped when the call returns, on success and on error
//! - A wrong passphrase is detected by the GCM authentication tag; nothing is
//!   ever partially decrypted
//! - Crypto errors carry sanitized messages in release builds

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, ExtendedPrivKey};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::PublicKey;
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zeroize::{Zeroize, Zeroizing};

use agentvault_common::config::VaultConfig;
use agentvault_common::error::{create_crypto_error, WalletError, WalletResult};
use agentvault_common::logging::{log_security, LogLevel};
use agentvault_common::storage;
use agentvault_common::types::{ChainParams, CoinNetwork, SecretBytes};

use crate::address::p2pkh_address;
use crate::scheduler::Countdown;
use crate::{files, lock_or_recover};

pub const KEYSTORE_VERSION: u32 = 1;
pub const CIPHER_NAME: &str = "aes-256-gcm";
pub const KDF_NAME: &str = "argon2id";
pub const PRIVATE_KEY_SIZE: usize = 32;
pub const MNEMONIC_WORDS: usize = 24;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const DERIVED_KEY_SIZE: usize = 32;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfSettings {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl From<&VaultConfig> for KdfSettings {
    fn from(config: &VaultConfig) -> Self {
        Self {
            memory_kib: config.kdf_memory_kib,
            iterations: config.kdf_iterations,
            parallelism: config.kdf_parallelism,
        }
    }
}

/// Everything the vault needs to know about its environment
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub data_dir: PathBuf,
    pub chain: ChainParams,
    pub kdf: KdfSettings,
    pub auto_lock: Duration,
}

impl VaultSettings {
    pub fn from_config(data_dir: &Path, chain: ChainParams, config: &VaultConfig) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            chain,
            kdf: KdfSettings::from(config),
            auto_lock: Duration::from_secs(config.auto_lock_secs),
        }
    }
}

/// KDF parameters as persisted in the keystore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub salt: String,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub dklen: u32,
}

/// Encrypted key section of the keystore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub cipher: String,
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub kdf: String,
    pub kdfparams: KdfParams,
}

/// On-disk keystore document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keystore {
    pub version: u32,
    pub crypto: KeystoreCrypto,
    pub address: String,
    pub network: CoinNetwork,
}

struct VaultState {
    key: Option<SecretBytes>,
    deadline: Option<Instant>,
}

impl VaultState {
    fn wipe(&mut self) {
        // Dropping SecretBytes zeroes the buffer
        self.key = None;
        self.deadline = None;
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(at) if now >= at)
    }
}

/// Encrypted single-key vault
pub struct KeyVault {
    settings: VaultSettings,
    keystore_path: PathBuf,
    state: Arc<Mutex<VaultState>>,
    address: Mutex<Option<String>>,
    auto_lock: Countdown,
}

impl KeyVault {
    pub fn new(settings: VaultSettings) -> WalletResult<Self> {
        let state = Arc::new(Mutex::new(VaultState {
            key: None,
            deadline: None,
        }));

        let weak = Arc::downgrade(&state);
        let auto_lock = Countdown::spawn("vault-auto-lock", move || {
            if let Some(state) = weak.upgrade() {
                let mut state = lock_or_recover(&state);
                // A re-arm may race the expiry; the deadline decides
                if state.is_expired(Instant::now()) {
                    state.wipe();
                    log_security(LogLevel::Info, "vault auto-locked", None);
                }
            }
        })?;

        let keystore_path = settings.data_dir.join(files::KEYSTORE);
        let vault = Self {
            settings,
            keystore_path,
            state,
            address: Mutex::new(None),
            auto_lock,
        };

        if let Some(keystore) = vault.load_keystore()? {
            *lock_or_recover(&vault.address) = Some(keystore.address);
        }
        Ok(vault)
    }

    pub fn chain(&self) -> &ChainParams {
        &self.settings.chain
    }

    pub fn is_initialized(&self) -> bool {
        self.keystore_path.exists()
    }

    pub fn is_unlocked(&self) -> bool {
        let state = lock_or_recover(&self.state);
        state.key.is_some() && !state.is_expired(Instant::now())
    }

    /// Receiving address, readable while locked
    pub fn address(&self) -> WalletResult<String> {
        lock_or_recover(&self.address)
            .clone()
            .ok_or(WalletError::WalletNotInitialized)
    }

    /// Create a new wallet and return its recovery phrase
    ///
    /// Fails if a keystore already exists. The vault is left unlocked.
    pub fn init(&self, passphrase: SecretBytes) -> WalletResult<SecretBytes> {
        if self.is_initialized() {
            return Err(WalletError::WalletAlreadyInitialized);
        }

        let mut entropy = Zeroizing::new([0u8; 32]);
        fill_random(&mut entropy[..])?;
        let mnemonic = Mnemonic::from_entropy(&entropy[..])
            .map_err(|e| create_crypto_error(&format!("mnemonic generation: {}", e), "Mnemonic generation failed"))?;

        let phrase = SecretBytes::from(mnemonic.to_string());
        self.install(&mnemonic, &passphrase)?;

        log_security(
            LogLevel::Info,
            "wallet initialized",
            Some(json!({"words": MNEMONIC_WORDS, "network": self.settings.chain.network.as_str()})),
        );
        Ok(phrase)
    }

    /// Restore a wallet from its recovery phrase, replacing any existing keystore
    pub fn recover(&self, phrase: SecretBytes, passphrase: SecretBytes) -> WalletResult<String> {
        let mnemonic = parse_phrase(&phrase)?;
        self.install(&mnemonic, &passphrase)?;
        log_security(LogLevel::Info, "wallet recovered from phrase", None);
        self.address()
    }

    /// Decrypt the keystore and hold the key in memory
    pub fn unlock(&self, passphrase: SecretBytes) -> WalletResult<()> {
        let keystore = self
            .load_keystore()?
            .ok_or(WalletError::WalletNotInitialized)?;

        let key = match decrypt_key(&keystore.crypto, &passphrase) {
            Ok(key) => key,
            Err(e) => {
                log_security(LogLevel::Warn, "unlock rejected", Some(json!({"reason": e.kind()})));
                return Err(e);
            }
        };

        *lock_or_recover(&self.address) = Some(keystore.address);
        self.hold_key(key);
        log_security(LogLevel::Info, "vault unlocked", None);
        Ok(())
    }

    /// Zero the in-memory key and cancel the auto-lock countdown
    pub fn lock(&self) {
        lock_or_recover(&self.state).wipe();
        self.auto_lock.cancel();
        log_security(LogLevel::Info, "vault locked", None);
    }

    /// Independent copy of the private key; re-arms the auto-lock
    pub fn get_private_key(&self) -> WalletResult<SecretBytes> {
        let mut state = lock_or_recover(&self.state);
        let now = Instant::now();

        if state.is_expired(now) {
            state.wipe();
            return Err(WalletError::WalletLocked);
        }

        let copy = match &state.key {
            Some(key) => key.duplicate(),
            None => return Err(WalletError::WalletLocked),
        };

        state.deadline = Some(now + self.settings.auto_lock);
        drop(state);
        self.auto_lock.arm(self.settings.auto_lock);
        Ok(copy)
    }

    /// Compressed public key of the unlocked wallet
    pub fn public_key(&self) -> WalletResult<PublicKey> {
        let key = self.get_private_key()?;
        let secp = Secp256k1::signing_only();
        let mut secret = SecretKey::from_slice(key.expose_secret())
            .map_err(|e| create_crypto_error(&format!("stored key invalid: {}", e), "Stored key invalid"))?;
        let pubkey = PublicKey::new(secret.public_key(&secp));
        secret.non_secure_erase();
        Ok(pubkey)
    }

    /// Re-encrypt the key under a new passphrase with fresh salt and nonce
    pub fn change_passphrase(&self, old: SecretBytes, new: SecretBytes) -> WalletResult<()> {
        let keystore = self
            .load_keystore()?
            .ok_or(WalletError::WalletNotInitialized)?;
        let key = decrypt_key(&keystore.crypto, &old)?;
        let crypto = encrypt_key(&key, &new, &self.settings.kdf)?;

        let updated = Keystore { crypto, ..keystore };
        storage::write_json_private(&self.keystore_path, &updated)?;
        log_security(LogLevel::Info, "passphrase changed", None);
        Ok(())
    }

    fn install(&self, mnemonic: &Mnemonic, passphrase: &SecretBytes) -> WalletResult<()> {
        let (key, pubkey) = derive_keypair(mnemonic, &self.settings.chain)?;
        let address = p2pkh_address(&pubkey, &self.settings.chain);
        let crypto = encrypt_key(&key, passphrase, &self.settings.kdf)?;

        let keystore = Keystore {
            version: KEYSTORE_VERSION,
            crypto,
            address: address.clone(),
            network: self.settings.chain.network,
        };

        storage::ensure_private_dir(&self.settings.data_dir)?;
        storage::write_json_private(&self.keystore_path, &keystore)?;

        *lock_or_recover(&self.address) = Some(address);
        self.hold_key(key);
        Ok(())
    }

    fn hold_key(&self, key: SecretBytes) {
        {
            let mut state = lock_or_recover(&self.state);
            state.key = Some(key);
            state.deadline = Some(Instant::now() + self.settings.auto_lock);
        }
        self.auto_lock.arm(self.settings.auto_lock);
    }

    fn load_keystore(&self) -> WalletResult<Option<Keystore>> {
        let keystore: Option<Keystore> = storage::read_json(&self.keystore_path)?;
        if let Some(ks) = &keystore {
            if ks.version != KEYSTORE_VERSION {
                return Err(WalletError::Serialization(format!(
                    "unsupported keystore version {}",
                    ks.version
                )));
            }
            if ks.network != self.settings.chain.network {
                return Err(WalletError::Config(format!(
                    "keystore is for {}, wallet configured for {}",
                    ks.network, self.settings.chain.network
                )));
            }
        }
        Ok(keystore)
    }
}

impl Drop for KeyVault {
    fn drop(&mut self) {
        lock_or_recover(&self.state).wipe();
    }
}

fn fill_random(buf: &mut [u8]) -> WalletResult<()> {
    OsRng.try_fill_bytes(buf).map_err(|e| {
        log_security(LogLevel::Error, "system randomness unavailable", None);
        create_crypto_error(&format!("OS RNG failure: {}", e), "Randomness unavailable")
    })
}

/// Parse a recovery phrase, tolerating case and whitespace differences
fn parse_phrase(phrase: &SecretBytes) -> WalletResult<Mnemonic> {
    let text = phrase
        .expose_str()
        .map_err(|_| WalletError::InvalidMnemonic("phrase is not valid UTF-8".into()))?;

    let normalized = Zeroizing::new(
        text.split_whitespace()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join(" "),
    );

    Mnemonic::parse_normalized(&normalized).map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Derive the signing key at the chain's BIP44 path
fn derive_keypair(mnemonic: &Mnemonic, chain: &ChainParams) -> WalletResult<(SecretBytes, PublicKey)> {
    let secp = Secp256k1::new();
    let seed = Zeroizing::new(mnemonic.to_seed(""));

    // Extended keys are only used as a derivation vehicle; the network tag is irrelevant
    let mut master = ExtendedPrivKey::new_master(bitcoin::Network::Bitcoin, &seed[..])
        .map_err(|e| create_crypto_error(&format!("master key: {}", e), "Key derivation failed"))?;

    let path = DerivationPath::from_str(&chain.derivation_path())
        .map_err(|e| create_crypto_error(&format!("derivation path: {}", e), "Key derivation failed"))?;

    let derived = master.derive_priv(&secp, &path);
    master.private_key.non_secure_erase();
    let mut child = derived
        .map_err(|e| create_crypto_error(&format!("child key: {}", e), "Key derivation failed"))?;

    let pubkey = PublicKey::new(child.private_key.public_key(&secp));
    let mut bytes = child.private_key.secret_bytes();
    let key = SecretBytes::new(bytes.to_vec());
    bytes.zeroize();
    child.private_key.non_secure_erase();

    Ok((key, pubkey))
}

fn stretch_passphrase(
    passphrase: &SecretBytes,
    salt: &[u8],
    kdf: &KdfSettings,
) -> WalletResult<Zeroizing<[u8; DERIVED_KEY_SIZE]>> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(DERIVED_KEY_SIZE))
        .map_err(|e| create_crypto_error(&format!("argon2 params: {}", e), "Invalid KDF parameters"))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut derived = Zeroizing::new([0u8; DERIVED_KEY_SIZE]);
    argon
        .hash_password_into(passphrase.expose_secret(), salt, &mut derived[..])
        .map_err(|e| create_crypto_error(&format!("argon2: {}", e), "Key derivation failed"))?;
    Ok(derived)
}

fn encrypt_key(key: &SecretBytes, passphrase: &SecretBytes, kdf: &KdfSettings) -> WalletResult<KeystoreCrypto> {
    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; NONCE_SIZE];
    fill_random(&mut salt)?;
    fill_random(&mut iv)?;

    let derived = stretch_passphrase(passphrase, &salt, kdf)?;
    let cipher = Aes256Gcm::new_from_slice(&derived[..])
        .map_err(|_| create_crypto_error("AES key length mismatch", "Encryption failed"))?;

    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), key.expose_secret())
        .map_err(|e| create_crypto_error(&format!("AES-GCM encryption failed: {:?}", e), "Encryption failed"))?;

    // aes-gcm appends the tag; the keystore stores it separately
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(KeystoreCrypto {
        cipher: CIPHER_NAME.to_string(),
        ciphertext: hex::encode(&sealed),
        iv: hex::encode(iv),
        tag: hex::encode(tag),
        kdf: KDF_NAME.to_string(),
        kdfparams: KdfParams {
            salt: hex::encode(salt),
            memory_kib: kdf.memory_kib,
            iterations: kdf.iterations,
            parallelism: kdf.parallelism,
            dklen: DERIVED_KEY_SIZE as u32,
        },
    })
}

fn decode_field(name: &str, value: &str) -> WalletResult<Vec<u8>> {
    hex::decode(value).map_err(|e| WalletError::Serialization(format!("keystore {}: {}", name, e)))
}

fn decrypt_key(crypto: &KeystoreCrypto, passphrase: &SecretBytes) -> WalletResult<SecretBytes> {
    if crypto.cipher != CIPHER_NAME || crypto.kdf != KDF_NAME {
        return Err(WalletError::Serialization(format!(
            "unsupported keystore scheme {}/{}",
            crypto.cipher, crypto.kdf
        )));
    }
    if crypto.kdfparams.dklen as usize != DERIVED_KEY_SIZE {
        return Err(WalletError::Serialization("unsupported derived key length".into()));
    }

    let salt = decode_field("salt", &crypto.kdfparams.salt)?;
    let iv = decode_field("iv", &crypto.iv)?;
    let mut sealed = decode_field("ciphertext", &crypto.ciphertext)?;
    sealed.extend_from_slice(&decode_field("tag", &crypto.tag)?);

    if iv.len() != NONCE_SIZE {
        return Err(WalletError::Serialization("keystore iv has wrong length".into()));
    }

    let kdf = KdfSettings {
        memory_kib: crypto.kdfparams.memory_kib,
        iterations: crypto.kdfparams.iterations,
        parallelism: crypto.kdfparams.parallelism,
    };
    let derived = stretch_passphrase(passphrase, &salt, &kdf)?;
    let cipher = Aes256Gcm::new_from_slice(&derived[..])
        .map_err(|_| create_crypto_error("AES key length mismatch", "Decryption failed"))?;

    // Authentication failure is the only signal of a wrong passphrase
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| WalletError::InvalidPassphrase)?;
    let key = SecretBytes::new(plaintext);

    if key.len() != PRIVATE_KEY_SIZE {
        return Err(create_crypto_error("decrypted key has wrong length", "Stored key invalid"));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_kdf() -> KdfSettings {
        KdfSettings {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn encrypt_then_decrypt_with_same_passphrase() {
        let key = SecretBytes::new(vec![9u8; 32]);
        let pass = SecretBytes::from_str_bytes("pass");
        let crypto = encrypt_key(&key, &pass, &cheap_kdf()).unwrap();
        assert_eq!(hex::decode(&crypto.tag).unwrap().len(), TAG_SIZE);
        assert_eq!(hex::decode(&crypto.ciphertext).unwrap().len(), PRIVATE_KEY_SIZE);

        let recovered = decrypt_key(&crypto, &pass).unwrap();
        assert_eq!(recovered.expose_secret(), key.expose_secret());
    }

    #[test]
    fn tampered_tag_reads_as_wrong_passphrase() {
        let key = SecretBytes::new(vec![1u8; 32]);
        let pass = SecretBytes::from_str_bytes("pass");
        let mut crypto = encrypt_key(&key, &pass, &cheap_kdf()).unwrap();
        crypto.tag = hex::encode([0u8; TAG_SIZE]);
        assert!(matches!(decrypt_key(&crypto, &pass), Err(WalletError::InvalidPassphrase)));
    }

    #[test]
    fn derivation_is_deterministic() {
        let mnemonic = Mnemonic::from_entropy(&[0u8; 32]).unwrap();
        let chain = ChainParams::dogecoin();
        let (k1, p1) = derive_keypair(&mnemonic, &chain).unwrap();
        let (k2, p2) = derive_keypair(&mnemonic, &chain).unwrap();
        assert_eq!(k1.expose_secret(), k2.expose_secret());
        assert_eq!(p1, p2);
        assert!(p1.compressed);
    }

    #[test]
    fn phrase_parsing_normalizes_whitespace() {
        let mnemonic = Mnemonic::from_entropy(&[7u8; 32]).unwrap();
        let messy = format!("  {}  ", mnemonic.to_string().to_uppercase().replace(' ', "   "));
        let parsed = parse_phrase(&SecretBytes::from(messy)).unwrap();
        assert_eq!(parsed, mnemonic);
    }
}
