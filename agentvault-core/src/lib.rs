//! AgentVault Core
//!
//! The money-movement pipeline of an agent-custodied wallet: an encrypted
//! key vault, a local UTXO ledger with coin selection, transaction
//! construction/signing/broadcast/confirmation tracking, a tiered spending
//! policy with an approval workflow, and a failover gateway over redundant
//! chain data providers.
//!
//! # Modules
//!
//! - `key_vault`: Encrypted keystore, lock/unlock/auto-lock, HD derivation
//! - `address`: Base58Check P2PKH/P2SH addresses and their scripts
//! - `gateway`: Provider interface, failover routing, HTTP and mock providers
//! - `utxo_selection`: Exact-match and largest-first coin selection
//! - `utxo_management`: The persisted UTXO ledger
//! - `transaction`: Building, signing, broadcasting and confirmation tracking
//! - `policy`: Spending tiers, approvals and rolling limits
//! - `scheduler`: Repeating background jobs and the auto-lock countdown
//! - `events`: Notifier and audit logger interfaces
//! - `wallet_operations`: The `AgentWallet` facade used by the command surface
//!
//! # Security Considerations
//!
//! - Key material only leaves the vault as an independent zeroizing copy
//! - Selection and locking of inputs happen in one critical section
//! - A failed broadcast always releases its reserved inputs

use std::sync::{Mutex, MutexGuard};

pub mod address;
pub mod events;
pub mod gateway;
pub mod key_vault;
pub mod policy;
pub mod scheduler;
pub mod transaction;
pub mod utxo_management;
pub mod utxo_selection;
pub mod wallet_operations;

pub use events::{AuditEntry, AuditLogger, Notifier, WalletEvent};
pub use gateway::{ChainProvider, FailoverGateway};
pub use key_vault::KeyVault;
pub use policy::{ApprovalQueue, LimitTracker, PolicyDecision, PolicyGate, SpendAction};
pub use transaction::{ConfirmationTracker, TransactionPipeline};
pub use utxo_management::{UnspentOutput, UtxoLedger};
pub use utxo_selection::{CoinSelector, Selection};
pub use wallet_operations::{AgentWallet, SendOutcome};

/// File names inside the wallet data directory
pub mod files {
    pub const KEYSTORE: &str = "keystore.json";
    pub const UTXO_CACHE: &str = "utxos.json";
    pub const APPROVALS: &str = "approvals.json";
    pub const SPEND_RECORDS: &str = "spend_records.json";
    pub const POLICY_STATE: &str = "policy_state.json";
    pub const TRACKED_TXS: &str = "tracked_transactions.json";
}

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// Every critical section in this crate leaves its state consistent before
/// any call that could panic, so the inner value is still usable.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Random hex identifier with a readable prefix, e.g. `apr-1f9c0a...`
pub(crate) fn random_id(prefix: &str) -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}-{}", prefix, hex::encode(bytes))
}
