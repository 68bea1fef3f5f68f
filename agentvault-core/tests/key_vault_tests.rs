mod test_utils;

use std::fs;
use std::thread;
use std::time::Duration;

use agentvault_common::types::{ChainParams, SecretBytes};
use agentvault_common::WalletError;
use agentvault_core::files;
use agentvault_core::key_vault::{Keystore, KeyVault, VaultSettings};
use tempfile::tempdir;
use test_utils::*;

const KNOWN_PHRASE: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn new_vault(settings: VaultSettings) -> KeyVault {
    init_test_environment();
    KeyVault::new(settings).unwrap()
}

#[test]
fn init_returns_phrase_and_leaves_vault_unlocked() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    assert!(!vault.is_initialized());
    assert!(matches!(vault.address(), Err(WalletError::WalletNotInitialized)));

    let phrase = vault.init(passphrase()).unwrap();
    assert_eq!(phrase.expose_str().unwrap().split_whitespace().count(), 24);
    assert!(vault.is_initialized());
    assert!(vault.is_unlocked());
    assert!(vault.address().unwrap().starts_with('D'));
}

#[test]
fn second_init_is_rejected() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    vault.init(passphrase()).unwrap();
    assert!(matches!(vault.init(passphrase()), Err(WalletError::WalletAlreadyInitialized)));
}

#[test]
fn keystore_holds_no_plaintext_secrets() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    let phrase = vault.init(passphrase()).unwrap();
    let key = vault.get_private_key().unwrap();

    let raw = fs::read_to_string(dir.path().join(files::KEYSTORE)).unwrap();
    assert!(!raw.contains(&hex::encode(key.expose_secret())));
    assert!(!raw.contains(PASSPHRASE));
    assert!(!raw.contains(phrase.expose_str().unwrap()));

    let keystore: Keystore = serde_json::from_str(&raw).unwrap();
    assert_eq!(keystore.crypto.cipher, "aes-256-gcm");
    assert_eq!(keystore.crypto.kdf, "argon2id");
    assert_eq!(keystore.address, vault.address().unwrap());
}

#[test]
fn lock_unlock_round_trip() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    vault.init(passphrase()).unwrap();
    let before = vault.get_private_key().unwrap();

    vault.lock();
    assert!(!vault.is_unlocked());
    assert!(matches!(vault.get_private_key(), Err(WalletError::WalletLocked)));
    // The address stays readable while locked
    assert!(vault.address().is_ok());

    vault.unlock(passphrase()).unwrap();
    let after = vault.get_private_key().unwrap();
    assert_eq!(before.expose_secret(), after.expose_secret());
}

#[test]
fn wrong_passphrase_is_rejected() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    vault.init(passphrase()).unwrap();
    vault.lock();

    let result = vault.unlock(SecretBytes::from_str_bytes("wrong-pass"));
    assert!(matches!(result, Err(WalletError::InvalidPassphrase)));
    assert!(!vault.is_unlocked());
}

#[test]
fn unlock_before_init_fails() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    assert!(matches!(vault.unlock(passphrase()), Err(WalletError::WalletNotInitialized)));
}

#[test]
fn private_key_copies_are_independent() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    vault.init(passphrase()).unwrap();

    let mut copy = vault.get_private_key().unwrap();
    copy.clear();
    assert!(copy.is_empty());

    let fresh = vault.get_private_key().unwrap();
    assert_eq!(fresh.len(), 32);
}

#[test]
fn vault_locks_itself_after_inactivity() {
    let dir = tempdir().unwrap();
    let mut settings = vault_settings(dir.path());
    settings.auto_lock = Duration::from_millis(100);
    let vault = new_vault(settings);
    vault.init(passphrase()).unwrap();
    vault.get_private_key().unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(!vault.is_unlocked());
    assert!(matches!(vault.get_private_key(), Err(WalletError::WalletLocked)));
}

#[test]
fn recover_is_deterministic_across_vaults() {
    let first = tempdir().unwrap();
    let second = tempdir().unwrap();
    let a = new_vault(vault_settings(first.path()));
    let b = new_vault(vault_settings(second.path()));

    let addr_a = a
        .recover(SecretBytes::from_str_bytes(KNOWN_PHRASE), passphrase())
        .unwrap();
    // Case and spacing are normalized
    let messy = format!("  {}  ", KNOWN_PHRASE.to_uppercase().replace(' ', "  "));
    let addr_b = b
        .recover(SecretBytes::from(messy), SecretBytes::from_str_bytes("other-pass"))
        .unwrap();

    assert_eq!(addr_a, addr_b);
    assert_eq!(a.get_private_key().unwrap().expose_secret(), b.get_private_key().unwrap().expose_secret());
}

#[test]
fn recover_rejects_invalid_phrase() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    let result = vault.recover(SecretBytes::from_str_bytes("not a real recovery phrase"), passphrase());
    assert!(matches!(result, Err(WalletError::InvalidMnemonic(_))));
    assert!(!vault.is_initialized());
}

#[test]
fn testnet_vault_uses_testnet_addresses() {
    let dir = tempdir().unwrap();
    let mut settings = vault_settings(dir.path());
    settings.chain = ChainParams::dogecoin_testnet();
    let vault = new_vault(settings);
    let address = vault
        .recover(SecretBytes::from_str_bytes(KNOWN_PHRASE), passphrase())
        .unwrap();
    assert!(address.starts_with('n'));
}

#[test]
fn change_passphrase_reencrypts_the_key() {
    let dir = tempdir().unwrap();
    let vault = new_vault(vault_settings(dir.path()));
    vault.init(passphrase()).unwrap();
    let key = vault.get_private_key().unwrap();
    vault.lock();

    let new_pass = SecretBytes::from_str_bytes("new-pass-67890");
    assert!(matches!(
        vault.change_passphrase(SecretBytes::from_str_bytes("wrong"), new_pass.duplicate()),
        Err(WalletError::InvalidPassphrase)
    ));
    vault.change_passphrase(passphrase(), new_pass.duplicate()).unwrap();

    assert!(matches!(vault.unlock(passphrase()), Err(WalletError::InvalidPassphrase)));
    vault.unlock(new_pass).unwrap();
    assert_eq!(vault.get_private_key().unwrap().expose_secret(), key.expose_secret());
}

#[test]
fn reopened_vault_knows_its_address_while_locked() {
    let dir = tempdir().unwrap();
    let address = {
        let vault = new_vault(vault_settings(dir.path()));
        vault.init(passphrase()).unwrap();
        vault.address().unwrap()
    };

    let reopened = new_vault(vault_settings(dir.path()));
    assert!(reopened.is_initialized());
    assert!(!reopened.is_unlocked());
    assert_eq!(reopened.address().unwrap(), address);
}

#[test]
fn keystore_for_another_network_is_refused() {
    let dir = tempdir().unwrap();
    {
        let vault = new_vault(vault_settings(dir.path()));
        vault.init(passphrase()).unwrap();
    }

    let mut settings = vault_settings(dir.path());
    settings.chain = ChainParams::dogecoin_testnet();
    assert!(KeyVault::new(settings).is_err());
}
