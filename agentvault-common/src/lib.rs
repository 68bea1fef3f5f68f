//! AgentVault Common Library
//!
//! Shared building blocks for the AgentVault agent wallet.
//!
//! # Modules
//!
//! - `types`: Secret buffers, chain parameters and fee speeds
//! - `error`: The `WalletError` taxonomy
//! - `math`: Minor/major unit conversion and P2PKH fee estimation
//! - `logging`: Security-aware logging infrastructure
//! - `config`: TOML configuration
//! - `storage`: Owner-only whole-document JSON persistence
//!
//! # Security Considerations
//!
//! - Secrets live in zeroizing byte buffers, never in `String`
//! - Log helpers sanitize addresses and transaction ids
//! - Persisted files are written 0600 inside 0700 directories

/// Core domain types
pub mod types;

/// Error taxonomy
pub mod error;

/// Amount and fee arithmetic
pub mod math;

/// Secure logging functionality
pub mod logging;

/// Configuration management
pub mod config;

/// Owner-only persistence
pub mod storage;

pub use config::Config;
pub use error::{WalletError, WalletResult};
pub use types::{ChainParams, CoinNetwork, FeeSpeed, SecretBytes};

/// Version information
pub mod version {
    /// Current crate version
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Version of the persisted document formats
    pub const STATE_FORMAT_VERSION: u32 = 1;
}
