//! Wallet events, notification and audit interfaces
//!
//! Delivery of notifications and persistence of the audit trail live outside
//! the wallet. The core only calls the [`Notifier`] and [`AuditLogger`]
//! traits; their failures are logged and swallowed so a broken notification
//! channel can never block or roll back a spend.
//!
//! ## Security Considerations
//!
//! - Events and audit entries carry amounts, txids and addresses only, never
//!   key material or phrases
//! - The log-backed defaults go through the sanitizing log helpers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use agentvault_common::error::WalletResult;
use agentvault_common::logging::{log_core, LogLevel};

/// Urgency of an event for the notification channel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    Sent {
        txid: String,
        recipient: String,
        amount: u64,
        fee: u64,
    },
    Received {
        txid: String,
        amount: u64,
    },
    ApprovalNeeded {
        id: String,
        recipient: String,
        amount: u64,
        tier: String,
        expires_at: DateTime<Utc>,
    },
    PolicyBlocked {
        recipient: String,
        amount: u64,
        reason: String,
    },
    Frozen {
        reason: String,
    },
    Unfrozen,
    TransactionConfirmed {
        txid: String,
        confirmations: u32,
    },
    TransactionFailed {
        txid: String,
    },
}

impl WalletEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WalletEvent::Sent { .. } => "sent",
            WalletEvent::Received { .. } => "received",
            WalletEvent::ApprovalNeeded { .. } => "approval_needed",
            WalletEvent::PolicyBlocked { .. } => "policy_blocked",
            WalletEvent::Frozen { .. } => "frozen",
            WalletEvent::Unfrozen => "unfrozen",
            WalletEvent::TransactionConfirmed { .. } => "transaction_confirmed",
            WalletEvent::TransactionFailed { .. } => "transaction_failed",
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            WalletEvent::Received { .. } | WalletEvent::TransactionConfirmed { .. } => EventPriority::Low,
            WalletEvent::Sent { .. } | WalletEvent::Unfrozen => EventPriority::Medium,
            WalletEvent::ApprovalNeeded { .. } | WalletEvent::PolicyBlocked { .. } => EventPriority::High,
            WalletEvent::Frozen { .. } | WalletEvent::TransactionFailed { .. } => EventPriority::Critical,
        }
    }
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub txid: Option<String>,
    pub amount: Option<u64>,
    pub tier: Option<String>,
    pub reason: String,
    /// Who triggered it: `agent`, the owner id, or the auto-timeout actor
    pub initiator: String,
}

impl AuditEntry {
    pub fn new(action: &str, reason: impl Into<String>, initiator: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            txid: None,
            amount: None,
            tier: None,
            reason: reason.into(),
            initiator: initiator.to_string(),
        }
    }

    pub fn with_txid(mut self, txid: &str) -> Self {
        self.txid = Some(txid.to_string());
        self
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_tier(mut self, tier: &str) -> Self {
        self.tier = Some(tier.to_string());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &WalletEvent) -> WalletResult<()>;
}

pub trait AuditLogger: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> WalletResult<()>;
}

/// Writes events to the application log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &WalletEvent) -> WalletResult<()> {
        let level = match event.priority() {
            EventPriority::Low => LogLevel::Debug,
            EventPriority::Medium => LogLevel::Info,
            EventPriority::High | EventPriority::Critical => LogLevel::Warn,
        };
        log_core(level, "wallet event", Some(json!({"event": event.kind()})));
        Ok(())
    }
}

/// Writes audit entries to the application log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditLogger;

impl AuditLogger for LogAuditLogger {
    fn record(&self, entry: &AuditEntry) -> WalletResult<()> {
        log_core(
            LogLevel::Info,
            "audit",
            Some(json!({
                "action": entry.action,
                "txid": entry.txid,
                "amount": entry.amount,
                "tier": entry.tier,
                "reason": entry.reason,
                "initiator": entry.initiator,
            })),
        );
        Ok(())
    }
}

/// Deliver an event, logging and dropping any failure
pub fn dispatch(notifier: &dyn Notifier, event: &WalletEvent) {
    if let Err(e) = notifier.notify(event) {
        log_core(
            LogLevel::Warn,
            "notifier failed",
            Some(json!({"event": event.kind(), "error": e.to_string()})),
        );
    }
}

/// Record an audit entry, logging and dropping any failure
pub fn audit(logger: &dyn AuditLogger, entry: AuditEntry) {
    if let Err(e) = logger.record(&entry) {
        log_core(
            LogLevel::Warn,
            "audit logger failed",
            Some(json!({"action": entry.action, "error": e.to_string()})),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentvault_common::error::WalletError;

    struct Broken;

    impl Notifier for Broken {
        fn notify(&self, _event: &WalletEvent) -> WalletResult<()> {
            Err(WalletError::Config("channel closed".into()))
        }
    }

    impl AuditLogger for Broken {
        fn record(&self, _entry: &AuditEntry) -> WalletResult<()> {
            Err(WalletError::Config("disk full".into()))
        }
    }

    #[test]
    fn failures_are_swallowed() {
        dispatch(&Broken, &WalletEvent::Unfrozen);
        audit(&Broken, AuditEntry::new("send", "test", "agent"));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = WalletEvent::Received {
            txid: "ab".into(),
            amount: 5,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "received");
        assert_eq!(event.priority(), EventPriority::Low);
    }
}
