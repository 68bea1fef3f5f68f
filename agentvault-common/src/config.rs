//! Configuration management for AgentVault.
//!
//! Settings are stored in TOML. Every field has a serde default so a partial
//! file (or an empty one) loads into a complete configuration. Amounts that
//! an owner edits by hand (limits, tier bounds, fee cap) are major-unit
//! decimals; the core converts them to minor units once at start-up.
//!
//! ## Security Considerations
//!
//! - No secret is ever stored here: passphrases are supplied at runtime
//! - The configuration is validated before any value reaches the policy gate
//! - An owner id is required for approvals; an empty one is rejected

use anyhow::{anyhow, bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging::LogConfig;
use crate::types::{CoinNetwork, FeeSpeed};

/// Action names accepted in tier definitions
pub const TIER_ACTIONS: &[&str] = &["auto", "auto_notify", "delay", "approve", "confirm", "deny"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default = "default_log_config")]
    pub logging: LogConfig,
}

/// Wallet identity and storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_network")]
    pub network: CoinNetwork,

    /// Directory holding the keystore and state documents (created 0700)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Caller id allowed to approve or deny pending spends
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: default_data_dir(),
            owner_id: default_owner_id(),
        }
    }
}

/// Key vault tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Inactivity window before the key is wiped from memory
    #[serde(default = "default_auto_lock_secs")]
    pub auto_lock_secs: u64,

    /// Argon2id memory cost in KiB
    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,

    /// Argon2id passes
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Argon2id lanes
    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            auto_lock_secs: default_auto_lock_secs(),
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
            kdf_parallelism: default_kdf_parallelism(),
        }
    }
}

/// Fee settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Speed tier requested from providers
    #[serde(default = "default_fee_speed")]
    pub speed: FeeSpeed,

    /// Fallback rate in minor units per byte when providers give none
    #[serde(default = "default_fee_rate")]
    pub fallback_rate: u64,

    /// Configured fee cap in major units; building fails above twice this
    #[serde(default = "default_max_fee")]
    pub max_fee: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            speed: default_fee_speed(),
            fallback_rate: default_fee_rate(),
            max_fee: default_max_fee(),
        }
    }
}

/// One spending tier, ordered by `max_amount`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    pub name: String,

    /// Inclusive upper bound in major units
    pub max_amount: Decimal,

    /// One of [`TIER_ACTIONS`]
    pub action: String,

    /// Hold time for the `delay` action and expiry for owner decisions
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

/// Spending policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: Decimal,

    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: Decimal,

    #[serde(default = "default_max_daily_tx")]
    pub max_daily_transactions: u32,

    /// Minimum seconds between two spends
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Default expiry of approval requests
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub denylist: Vec<String>,

    /// Ordered by bound; kept last so the TOML tables follow plain values
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            daily_limit: default_daily_limit(),
            hourly_limit: default_hourly_limit(),
            max_daily_transactions: default_max_daily_tx(),
            cooldown_secs: default_cooldown_secs(),
            approval_timeout_secs: default_approval_timeout_secs(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
        }
    }
}

/// A chain data provider endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,

    /// Provider implementation, currently `blockcypher`
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,
}

/// Network gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// How long a failed provider is demoted before it is retried optimistically
    #[serde(default = "default_unhealthy_cooldown_secs")]
    pub unhealthy_cooldown_secs: u64,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            timeout_secs: default_timeout(),
            unhealthy_cooldown_secs: default_unhealthy_cooldown_secs(),
        }
    }
}

/// Broadcast retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_retries")]
    pub retries: u32,

    /// Delay before the first retry; each later retry waits three times longer
    #[serde(default = "default_broadcast_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            retries: default_broadcast_retries(),
            initial_backoff_ms: default_broadcast_backoff_ms(),
        }
    }
}

/// Confirmation tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_poll_interval_secs")]
    pub max_poll_interval_secs: u64,

    /// A transaction unseen by healthy providers for this long is failed
    #[serde(default = "default_not_found_window_secs")]
    pub not_found_window_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            required_confirmations: default_required_confirmations(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_interval_secs: default_max_poll_interval_secs(),
            not_found_window_secs: default_not_found_window_secs(),
        }
    }
}

/// UTXO ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Spendable output count above which consolidation is advised
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: usize,

    /// Minimum confirmations for an output to be selected
    #[serde(default)]
    pub min_confirmations: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            consolidation_threshold: default_consolidation_threshold(),
            min_confirmations: 0,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| anyhow!("Failed to parse config file: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content).map_err(|e| anyhow!("Failed to write config file: {}", e))?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.wallet.owner_id.trim().is_empty() {
            bail!("Invalid owner id: must not be empty");
        }

        if self.vault.auto_lock_secs == 0 {
            bail!("Invalid auto-lock window: must be greater than 0");
        }

        if self.vault.kdf_memory_kib < 8 * self.vault.kdf_parallelism.max(1) {
            bail!("Invalid KDF memory cost: must be at least 8 KiB per lane");
        }

        if self.fees.max_fee <= Decimal::ZERO {
            bail!("Invalid fee cap: must be greater than 0");
        }

        if self.policy.tiers.is_empty() {
            bail!("Invalid policy: at least one tier is required");
        }

        let mut previous: Option<&TierConfig> = None;
        for tier in &self.policy.tiers {
            if !TIER_ACTIONS.contains(&tier.action.as_str()) {
                bail!("Invalid action '{}' for tier {}", tier.action, tier.name);
            }
            if let Some(prev) = previous {
                if tier.max_amount <= prev.max_amount {
                    bail!(
                        "Tier {} must have a larger bound than tier {}",
                        tier.name,
                        prev.name
                    );
                }
            }
            previous = Some(tier);
        }

        if self.gateway.providers.is_empty() {
            bail!("Invalid gateway: at least one provider is required");
        }

        if self.gateway.timeout_secs == 0 {
            bail!("Invalid network timeout: must be greater than 0");
        }

        if self.tracking.poll_interval_secs > self.tracking.max_poll_interval_secs {
            bail!("Invalid tracking: poll interval exceeds its maximum");
        }

        Ok(())
    }
}

/// Ensure a configuration file exists at the specified path
/// If it doesn't exist, create it with default values
pub fn ensure_config_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        let default_config = Config::default();
        let content = toml::to_string_pretty(&default_config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| anyhow!("Failed to create config directory: {}", e))?;
            }
        }

        fs::write(path, content)
            .map_err(|e| anyhow!("Failed to write default config file: {}", e))?;
    }

    Ok(())
}

// Default value functions

fn default_network() -> CoinNetwork {
    CoinNetwork::Dogecoin
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".agentvault"))
        .unwrap_or_else(|| PathBuf::from("./agentvault-data"))
}

fn default_owner_id() -> String {
    "owner".to_string()
}

fn default_auto_lock_secs() -> u64 {
    15 * 60
}

fn default_kdf_memory_kib() -> u32 {
    64 * 1024
}

fn default_kdf_iterations() -> u32 {
    3
}

fn default_kdf_parallelism() -> u32 {
    1
}

fn default_fee_speed() -> FeeSpeed {
    FeeSpeed::Medium
}

fn default_fee_rate() -> u64 {
    1_000
}

fn default_max_fee() -> Decimal {
    dec!(5)
}

fn tier(name: &str, max_amount: Decimal, action: &str, delay_secs: Option<u64>) -> TierConfig {
    TierConfig {
        name: name.to_string(),
        max_amount,
        action: action.to_string(),
        delay_secs,
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        tier("micro", dec!(10), "auto", None),
        tier("small", dec!(100), "auto_notify", None),
        tier("medium", dec!(1000), "delay", Some(300)),
        tier("large", dec!(10000), "approve", Some(3600)),
        tier("sweep", dec!(10000000000), "confirm", Some(3600)),
    ]
}

fn default_daily_limit() -> Decimal {
    dec!(5000)
}

fn default_hourly_limit() -> Decimal {
    dec!(1000)
}

fn default_max_daily_tx() -> u32 {
    50
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_approval_timeout_secs() -> u64 {
    3600
}

fn default_provider_kind() -> String {
    "blockcypher".to_string()
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig {
        name: "blockcypher".to_string(),
        kind: default_provider_kind(),
        base_url: "https://api.blockcypher.com/v1/doge/main".to_string(),
        api_token: None,
    }]
}

fn default_timeout() -> u64 {
    30
}

fn default_unhealthy_cooldown_secs() -> u64 {
    60
}

fn default_broadcast_retries() -> u32 {
    3
}

fn default_broadcast_backoff_ms() -> u64 {
    1_000
}

fn default_required_confirmations() -> u32 {
    6
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_poll_interval_secs() -> u64 {
    480
}

fn default_not_found_window_secs() -> u64 {
    30 * 60
}

fn default_refresh_interval_secs() -> u64 {
    120
}

fn default_consolidation_threshold() -> usize {
    50
}

fn default_log_config() -> LogConfig {
    LogConfig::default()
}
