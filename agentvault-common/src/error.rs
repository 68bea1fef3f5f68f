//! Standardized error handling for AgentVault
//!
//! Every fallible operation in the wallet returns a [`WalletError`]. The
//! variants are grouped by the component that raises them so callers (the
//! command surface, the background jobs) can decide whether to retry, ask the
//! owner, or give up without parsing message strings.
//!
//! # Security Considerations
//!
//! - Error messages never contain key material, seed words or passphrases
//! - Cryptographic failures are reported through [`create_crypto_error`], which
//!   returns a sanitized message in release builds
//! - Provider errors carry the provider name and HTTP status only, not bodies
//!   that might echo request data

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the workspace
pub type WalletResult<T> = Result<T, WalletError>;

/// Main error type for the agent wallet
#[derive(Debug, Error)]
pub enum WalletError {
    // Key vault
    #[error("Wallet is not initialized")]
    WalletNotInitialized,

    #[error("Wallet is already initialized")]
    WalletAlreadyInitialized,

    #[error("Wallet is locked")]
    WalletLocked,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    // Ledger and transaction building
    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Fee {fee} exceeds ceiling {ceiling}")]
    FeeTooHigh { fee: u64, ceiling: u64 },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Broadcast failed after {attempts} attempts: {reason}")]
    BroadcastFailed { attempts: u32, reason: String },

    // Network gateway
    #[error("Provider {provider} failed{}: {message}", status_suffix(.status))]
    ProviderError {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Provider {provider} rate limited{}", retry_suffix(.retry_after))]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("All providers unavailable (attempted: {}){}", .attempted.join(", "), last_error_suffix(.last_error))]
    ProviderUnavailable {
        attempted: Vec<String>,
        last_error: Option<String>,
    },

    // Policy
    #[error("Policy denied spend in tier {tier}: {reason}")]
    PolicyDenied { tier: String, reason: String },

    #[error("Caller is not authorized to decide approvals")]
    ApprovalUnauthorized,

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // Ambient
    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {})", s)).unwrap_or_default()
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": {}", e))
        .unwrap_or_default()
}

fn retry_suffix(retry_after: &Option<u64>) -> String {
    retry_after
        .map(|s| format!(", retry after {}s", s))
        .unwrap_or_default()
}

impl WalletError {
    /// Wrap an I/O error with a short description of what was being attempted
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        WalletError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error came from a data provider rather than local state
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            WalletError::ProviderError { .. }
                | WalletError::RateLimited { .. }
                | WalletError::ProviderUnavailable { .. }
        )
    }

    /// Short stable label for logs and audit entries
    pub fn kind(&self) -> &'static str {
        match self {
            WalletError::WalletNotInitialized => "wallet_not_initialized",
            WalletError::WalletAlreadyInitialized => "wallet_already_initialized",
            WalletError::WalletLocked => "wallet_locked",
            WalletError::InvalidPassphrase => "invalid_passphrase",
            WalletError::InvalidMnemonic(_) => "invalid_mnemonic",
            WalletError::Crypto(_) => "crypto",
            WalletError::InsufficientFunds { .. } => "insufficient_funds",
            WalletError::FeeTooHigh { .. } => "fee_too_high",
            WalletError::InvalidAddress(_) => "invalid_address",
            WalletError::InvalidAmount(_) => "invalid_amount",
            WalletError::Signing(_) => "signing",
            WalletError::BroadcastFailed { .. } => "broadcast_failed",
            WalletError::ProviderError { .. } => "provider_error",
            WalletError::RateLimited { .. } => "rate_limited",
            WalletError::ProviderUnavailable { .. } => "provider_unavailable",
            WalletError::PolicyDenied { .. } => "policy_denied",
            WalletError::ApprovalUnauthorized => "approval_unauthorized",
            WalletError::ApprovalNotFound(_) => "approval_not_found",
            WalletError::InvalidTransition(_) => "invalid_transition",
            WalletError::Io { .. } => "io",
            WalletError::Serialization(_) => "serialization",
            WalletError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        WalletError::Serialization(err.to_string())
    }
}

/// Create appropriate error messages based on build mode
///
/// In debug builds the detailed message is kept; release builds only carry
/// the sanitized production message.
pub fn create_crypto_error(debug_msg: &str, _prod_msg: &str) -> WalletError {
    #[cfg(debug_assertions)]
    {
        WalletError::Crypto(debug_msg.to_string())
    }

    #[cfg(not(debug_assertions))]
    {
        WalletError::Crypto(_prod_msg.to_string())
    }
}

/// Extension trait for attaching context to I/O results
pub trait IoContext<T> {
    fn io_context(self, context: impl Into<String>) -> WalletResult<T>;
}

impl<T> IoContext<T> for Result<T, io::Error> {
    fn io_context(self, context: impl Into<String>) -> WalletResult<T> {
        self.map_err(|e| WalletError::io(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_are_classified() {
        let err = WalletError::RateLimited {
            provider: "blockcypher".into(),
            retry_after: Some(30),
        };
        assert!(err.is_provider_error());
        assert_eq!(err.to_string(), "Provider blockcypher rate limited, retry after 30s");
        assert!(!WalletError::WalletLocked.is_provider_error());
    }

    #[test]
    fn io_context_is_attached() {
        let result: Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"));
        let err = result.io_context("reading keystore").unwrap_err();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("reading keystore"));
    }

    #[test]
    fn unavailable_lists_attempted_providers() {
        let err = WalletError::ProviderUnavailable {
            attempted: vec!["a".into(), "b".into()],
            last_error: None,
        };
        assert_eq!(err.to_string(), "All providers unavailable (attempted: a, b)");

        let err = WalletError::ProviderUnavailable {
            attempted: vec!["a".into()],
            last_error: Some("tx already in mempool".into()),
        };
        assert!(err.to_string().ends_with(": tx already in mempool"));
    }
}
