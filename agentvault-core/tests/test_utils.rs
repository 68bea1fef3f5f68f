#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::PublicKey;
use tempfile::TempDir;

use agentvault_common::config::Config;
use agentvault_common::logging::{self, LogConfig};
use agentvault_common::types::{ChainParams, SecretBytes};
use agentvault_common::WalletResult;
use agentvault_core::address::p2pkh_address;
use agentvault_core::gateway::{ChainProvider, FailoverGateway, MockProvider, ProviderUtxo};
use agentvault_core::key_vault::{KdfSettings, VaultSettings};
use agentvault_core::{AgentWallet, AuditEntry, AuditLogger, Notifier, WalletEvent};

pub const PASSPHRASE: &str = "test-pass-12345";
pub const OWNER: &str = "owner";

/// One DOGE in koinu
pub const COIN: u64 = 100_000_000;

static GLOBAL_TEST_INIT: Once = Once::new();

/// Initialize logging once per test binary
pub fn init_test_environment() {
    GLOBAL_TEST_INIT.call_once(|| {
        let _ = logging::init(&LogConfig::quiet());
    });
}

pub fn passphrase() -> SecretBytes {
    SecretBytes::from_str_bytes(PASSPHRASE)
}

pub fn cheap_kdf() -> KdfSettings {
    KdfSettings {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

pub fn vault_settings(dir: &Path) -> VaultSettings {
    VaultSettings {
        data_dir: dir.to_path_buf(),
        chain: ChainParams::dogecoin(),
        kdf: cheap_kdf(),
        auto_lock: Duration::from_secs(900),
    }
}

/// Default configuration with fast KDF, no cooldown and near-instant retries
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.wallet.data_dir = dir.to_path_buf();
    config.wallet.owner_id = OWNER.to_string();
    config.vault.kdf_memory_kib = 64;
    config.vault.kdf_iterations = 1;
    config.vault.kdf_parallelism = 1;
    config.policy.cooldown_secs = 0;
    config.broadcast.initial_backoff_ms = 1;
    config
}

pub fn mock_gateway(names: &[&str]) -> (Vec<Arc<MockProvider>>, Arc<FailoverGateway>) {
    let mocks: Vec<Arc<MockProvider>> = names.iter().map(|n| Arc::new(MockProvider::new(n))).collect();
    let providers: Vec<Arc<dyn ChainProvider>> = mocks
        .iter()
        .map(|m| m.clone() as Arc<dyn ChainProvider>)
        .collect();
    let gateway = FailoverGateway::new(providers, Duration::from_secs(60)).unwrap();
    (mocks, Arc::new(gateway))
}

pub fn txid(n: u32) -> String {
    format!("{:064x}", n)
}

pub fn provider_utxo(n: u32, amount: u64, confirmations: u32) -> ProviderUtxo {
    ProviderUtxo {
        txid: txid(n),
        vout: 0,
        amount,
        script: String::new(),
        confirmations,
    }
}

/// A valid address that does not belong to any test wallet
pub fn recipient_address(chain: &ChainParams) -> String {
    address_for_secret(0x11, chain)
}

pub fn address_for_secret(byte: u8, chain: &ChainParams) -> String {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
    p2pkh_address(&PublicKey::new(secret.public_key(&secp)), chain)
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<WalletEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<WalletEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &WalletEvent) -> WalletResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

impl AuditLogger for RecordingAudit {
    fn record(&self, entry: &AuditEntry) -> WalletResult<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

pub struct TestWallet {
    pub dir: TempDir,
    pub wallet: AgentWallet,
    pub provider: Arc<MockProvider>,
    pub events: Arc<RecordingNotifier>,
    pub audit: Arc<RecordingAudit>,
    pub address: String,
    pub recipient: String,
}

/// Initialized, unlocked wallet whose ledger holds one confirmed output per amount
pub fn funded_wallet(amounts: &[u64]) -> TestWallet {
    funded_wallet_with(amounts, |_| {})
}

pub fn funded_wallet_with(amounts: &[u64], adjust: impl FnOnce(&mut Config)) -> TestWallet {
    init_test_environment();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    adjust(&mut config);
    let chain = config.wallet.network.params();

    let (mut mocks, gateway) = mock_gateway(&["primary"]);
    let provider = mocks.remove(0);
    let events = Arc::new(RecordingNotifier::default());
    let audit = Arc::new(RecordingAudit::default());

    let wallet = AgentWallet::with_observers(config, gateway, events.clone(), audit.clone()).unwrap();
    wallet.init(passphrase()).unwrap();
    let address = wallet.address().unwrap();

    let utxos = amounts
        .iter()
        .enumerate()
        .map(|(i, amount)| provider_utxo(i as u32 + 1, *amount, 6))
        .collect();
    provider.set_utxos(&address, utxos);
    if !amounts.is_empty() {
        wallet.refresh().unwrap();
    }

    TestWallet {
        dir,
        wallet,
        provider,
        events,
        audit,
        address,
        recipient: recipient_address(&chain),
    }
}
