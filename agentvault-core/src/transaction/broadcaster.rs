//! Broadcast with retry and backoff
//!
//! A broadcast is attempted once and then retried on provider failures, the
//! delay growing threefold each time (1s, 3s, 9s with the defaults). A
//! provider answering that the transaction is already known counts as
//! success: an earlier attempt reached the network.

use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agentvault_common::config::BroadcastConfig;
use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_transaction, LogLevel};

use super::signer::SignedTransaction;
use crate::gateway::{ChainProvider, FailoverGateway};

const BACKOFF_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub initial_backoff: Duration,
}

impl From<&BroadcastConfig> for RetryPolicy {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            retries: config.retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Provider and node phrasings for "this exact transaction is already known"
const ALREADY_KNOWN: &[&str] = &[
    "already in block chain",
    "already in the block chain",
    "txn-already-known",
    "txn-already-in-mempool",
    "already in the mempool",
    "already in mempool",
    "already exists in mempool",
    "transaction already exists",
    "already have transaction",
];

/// Rejections of a conflicting spend; these mention "already" too
const CONFLICTS: &[&str] = &["spent", "missingorspent", "conflict", "double"];

/// Whether a rejection means the network already has the transaction
pub fn is_already_known(err: &WalletError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    if CONFLICTS.iter().any(|c| text.contains(c)) {
        return false;
    }
    ALREADY_KNOWN.iter().any(|p| text.contains(p))
}

pub struct Broadcaster {
    gateway: Arc<FailoverGateway>,
    policy: RetryPolicy,
}

impl Broadcaster {
    pub fn new(gateway: Arc<FailoverGateway>, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Submit `signed`, returning its txid
    pub fn broadcast(&self, signed: &SignedTransaction) -> WalletResult<String> {
        let attempts = self.policy.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.gateway.broadcast_tx(&signed.raw_hex) {
                Ok(reported) => {
                    if reported != signed.txid {
                        log_transaction(
                            LogLevel::Warn,
                            "provider reported a different txid",
                            Some(json!({"local": signed.txid, "reported": reported})),
                        );
                    }
                    log_transaction(
                        LogLevel::Info,
                        "transaction broadcast",
                        Some(json!({"txid": signed.txid, "attempt": attempt})),
                    );
                    return Ok(signed.txid.clone());
                }
                Err(err) if is_already_known(&err) => {
                    log_transaction(
                        LogLevel::Info,
                        "transaction already known to the network",
                        Some(json!({"txid": signed.txid, "attempt": attempt})),
                    );
                    return Ok(signed.txid.clone());
                }
                Err(err) if err.is_provider_error() => {
                    log_transaction(
                        LogLevel::Warn,
                        "broadcast attempt failed",
                        Some(json!({"txid": signed.txid, "attempt": attempt, "kind": err.kind()})),
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        thread::sleep(self.policy.backoff(attempt));
                    }
                }
                Err(err) => {
                    return Err(WalletError::BroadcastFailed {
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
            }
        }

        Err(WalletError::BroadcastFailed {
            attempts,
            reason: last_error,
        })
    }
}
