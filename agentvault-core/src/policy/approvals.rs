//! Approval queue for spends that need time or an owner decision
//!
//! ```text
//! pending ──► approved ──► executed
//!    ├──────► denied
//!    └──────► expired
//! ```
//!
//! Only the configured owner may approve or deny. At expiry, `delay` entries
//! become approved (decided by [`AUTO_TIMEOUT_ACTOR`]) and every other entry
//! expires, which counts as a denial.
//!
//! Decided entries are kept for [`DECIDED_RETENTION_DAYS`] after their
//! decision and dropped on the next write.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_policy, LogLevel};
use agentvault_common::storage;
use agentvault_common::version::STATE_FORMAT_VERSION;

use super::limits::Reservation;
use super::{PolicyDecision, SpendAction};
use crate::{files, lock_or_recover, random_id};

/// Actor recorded when an entry is decided by its timeout
pub const AUTO_TIMEOUT_ACTOR: &str = "system:auto-timeout";

/// How long denied, expired and executed entries stay in the queue file
pub const DECIDED_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Executed,
}

impl ApprovalStatus {
    /// Pending and approved entries still hold a claim on the limits
    pub fn is_open(&self) -> bool {
        matches!(self, ApprovalStatus::Pending | ApprovalStatus::Approved)
    }

    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        use ApprovalStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Denied) | (Pending, Expired) | (Approved, Executed)
        )
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Executed => "executed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub recipient: String,
    pub amount: u64,
    pub tier: String,
    pub action: SpendAction,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Set once the approved spend has been broadcast
    pub txid: Option<String>,
}

impl PendingApproval {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn transition(&mut self, next: ApprovalStatus) -> WalletResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(WalletError::InvalidTransition(format!(
                "approval {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApprovalDocument {
    version: u32,
    approvals: Vec<PendingApproval>,
}

pub struct ApprovalQueue {
    path: PathBuf,
    owner_id: String,
    entries: Mutex<Vec<PendingApproval>>,
}

impl ApprovalQueue {
    pub fn open(data_dir: &Path, owner_id: &str) -> WalletResult<Self> {
        let path = data_dir.join(files::APPROVALS);
        let entries = storage::read_json::<ApprovalDocument>(&path)?
            .map(|doc| doc.approvals)
            .unwrap_or_default();
        Ok(Self {
            path,
            owner_id: owner_id.to_string(),
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &mut Vec<PendingApproval>, now: DateTime<Utc>) -> WalletResult<()> {
        let cutoff = now - ChronoDuration::days(DECIDED_RETENTION_DAYS);
        entries.retain(|e| e.status.is_open() || e.decided_at.unwrap_or(e.created_at) >= cutoff);
        let doc = ApprovalDocument {
            version: STATE_FORMAT_VERSION,
            approvals: entries.to_vec(),
        };
        storage::write_json_private(&self.path, &doc)
    }

    /// Queue a spend that the gate routed to a delay or owner decision
    pub fn enqueue(
        &self,
        recipient: &str,
        amount: u64,
        decision: &PolicyDecision,
        hold: Duration,
    ) -> WalletResult<PendingApproval> {
        self.enqueue_at(recipient, amount, decision, hold, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        recipient: &str,
        amount: u64,
        decision: &PolicyDecision,
        hold: Duration,
        now: DateTime<Utc>,
    ) -> WalletResult<PendingApproval> {
        if !decision.allowed || !decision.action.is_queued() {
            return Err(WalletError::InvalidTransition(format!(
                "action {} is not queued for approval",
                decision.action
            )));
        }

        let hold = ChronoDuration::from_std(hold)
            .map_err(|_| WalletError::Config("approval hold time out of range".into()))?;
        let entry = PendingApproval {
            id: random_id("apr"),
            recipient: recipient.to_string(),
            amount,
            tier: decision.tier.clone(),
            action: decision.action,
            created_at: now,
            expires_at: now + hold,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            txid: None,
        };

        let mut entries = lock_or_recover(&self.entries);
        entries.push(entry.clone());
        self.persist(&mut entries, now)?;

        log_policy(
            LogLevel::Info,
            "spend queued for approval",
            Some(json!({
                "id": entry.id,
                "tier": entry.tier,
                "action": entry.action.as_str(),
                "expires_at": entry.expires_at.to_rfc3339(),
            })),
        );
        Ok(entry)
    }

    pub fn approve(&self, id: &str, caller: &str) -> WalletResult<PendingApproval> {
        self.owner_decision(id, caller, ApprovalStatus::Approved, Utc::now())
    }

    pub fn deny(&self, id: &str, caller: &str) -> WalletResult<PendingApproval> {
        self.owner_decision(id, caller, ApprovalStatus::Denied, Utc::now())
    }

    pub fn approve_at(&self, id: &str, caller: &str, now: DateTime<Utc>) -> WalletResult<PendingApproval> {
        self.owner_decision(id, caller, ApprovalStatus::Approved, now)
    }

    pub fn deny_at(&self, id: &str, caller: &str, now: DateTime<Utc>) -> WalletResult<PendingApproval> {
        self.owner_decision(id, caller, ApprovalStatus::Denied, now)
    }

    fn owner_decision(
        &self,
        id: &str,
        caller: &str,
        next: ApprovalStatus,
        now: DateTime<Utc>,
    ) -> WalletResult<PendingApproval> {
        if caller != self.owner_id || caller == AUTO_TIMEOUT_ACTOR {
            log_policy(
                LogLevel::Warn,
                "unauthorized approval decision rejected",
                Some(json!({"id": id, "caller": caller})),
            );
            return Err(WalletError::ApprovalUnauthorized);
        }

        // Let the timeout rule win for entries already past their expiry
        let expired = self.get(id).map(|e| e.status == ApprovalStatus::Pending && e.is_expired_at(now));
        match expired {
            None => return Err(WalletError::ApprovalNotFound(id.to_string())),
            Some(true) => {
                self.sweep_expired_at(now)?;
                let entry = self.get(id).ok_or_else(|| WalletError::ApprovalNotFound(id.to_string()))?;
                return Err(WalletError::InvalidTransition(format!(
                    "approval {} already timed out ({})",
                    id, entry.status
                )));
            }
            Some(false) => {}
        }

        self.decide(id, caller, next, now)
    }

    fn decide(&self, id: &str, actor: &str, next: ApprovalStatus, now: DateTime<Utc>) -> WalletResult<PendingApproval> {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WalletError::ApprovalNotFound(id.to_string()))?;

        entry.transition(next)?;
        entry.decided_by = Some(actor.to_string());
        entry.decided_at = Some(now);
        let decided = entry.clone();
        self.persist(&mut entries, now)?;

        log_policy(
            LogLevel::Info,
            "approval decided",
            Some(json!({"id": id, "status": decided.status.to_string(), "by": actor})),
        );
        Ok(decided)
    }

    pub fn sweep_expired(&self) -> WalletResult<Vec<PendingApproval>> {
        self.sweep_expired_at(Utc::now())
    }

    /// Apply the timeout rule to every pending entry past its expiry
    ///
    /// Returns the entries that changed; approved ones are ready to execute.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> WalletResult<Vec<PendingApproval>> {
        let due: Vec<(String, SpendAction)> = lock_or_recover(&self.entries)
            .iter()
            .filter(|e| e.status == ApprovalStatus::Pending && e.is_expired_at(now))
            .map(|e| (e.id.clone(), e.action))
            .collect();

        let mut changed = Vec::with_capacity(due.len());
        for (id, action) in due {
            let next = if action == SpendAction::Delay {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Expired
            };
            changed.push(self.decide(&id, AUTO_TIMEOUT_ACTOR, next, now)?);
        }
        Ok(changed)
    }

    /// Record that an approved spend went out
    pub fn mark_executed(&self, id: &str, txid: &str) -> WalletResult<PendingApproval> {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WalletError::ApprovalNotFound(id.to_string()))?;
        entry.transition(ApprovalStatus::Executed)?;
        entry.txid = Some(txid.to_string());
        let executed = entry.clone();
        self.persist(&mut entries, Utc::now())?;
        Ok(executed)
    }

    pub fn get(&self, id: &str) -> Option<PendingApproval> {
        lock_or_recover(&self.entries).iter().find(|e| e.id == id).cloned()
    }

    pub fn list_pending(&self) -> Vec<PendingApproval> {
        lock_or_recover(&self.entries)
            .iter()
            .filter(|e| e.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    /// Approved entries that have not been executed yet
    pub fn list_approved(&self) -> Vec<PendingApproval> {
        lock_or_recover(&self.entries)
            .iter()
            .filter(|e| e.status == ApprovalStatus::Approved)
            .cloned()
            .collect()
    }

    /// Amount and count of open entries, leaving out `except`
    pub fn outstanding(&self, except: Option<&str>) -> Reservation {
        let mut reserved = Reservation::default();
        for entry in lock_or_recover(&self.entries).iter() {
            if entry.status.is_open() && Some(entry.id.as_str()) != except {
                reserved.add(entry.amount);
            }
        }
        reserved
    }

    pub fn list(&self) -> Vec<PendingApproval> {
        lock_or_recover(&self.entries).clone()
    }
}
