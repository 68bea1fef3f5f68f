//! Confirmation tracking for broadcast transactions
//!
//! State machine:
//!
//! ```text
//! pending ──► confirming ──► confirmed
//!    │  ▲          │
//!    ▼  │          ▼
//!  unverified ──► failed
//! ```
//!
//! `confirmed` and `failed` are terminal. A transaction only fails after
//! healthy providers have consistently not known it for the whole not-found
//! window; when the answer comes from a degraded gateway it is marked
//! `unverified` instead and the poll interval backs off.
//!
//! Finished transactions are dropped [`FINISHED_RETENTION_DAYS`] after they
//! reached their terminal state.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentvault_common::config::TrackingConfig;
use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_transaction, LogLevel};
use agentvault_common::storage;
use agentvault_common::version::STATE_FORMAT_VERSION;

use crate::gateway::FailoverGateway;
use crate::{files, lock_or_recover};

/// How long confirmed and failed transactions stay in the tracker file
pub const FINISHED_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Pending,
    Confirming,
    Confirmed,
    Failed,
    Unverified,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Confirmed | TxState::Failed)
    }

    pub fn can_transition_to(&self, next: TxState) -> bool {
        !self.is_terminal() && *self != next
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Pending => "pending",
            TxState::Confirming => "confirming",
            TxState::Confirmed => "confirmed",
            TxState::Failed => "failed",
            TxState::Unverified => "unverified",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTransaction {
    pub txid: String,
    pub recipient: String,
    pub amount: u64,
    pub fee: u64,
    pub state: TxState,
    pub confirmations: u32,
    pub broadcast_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    /// Start of the current run of not-found answers from healthy providers
    pub not_found_since: Option<DateTime<Utc>>,
    /// When the transaction reached `confirmed` or `failed`
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrackedTransaction {
    fn finished_before(&self, cutoff: DateTime<Utc>) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        let finished = self
            .finished_at
            .or(self.last_checked)
            .unwrap_or(self.broadcast_at);
        finished < cutoff
    }

    fn transition(&mut self, next: TxState) -> WalletResult<Option<StateChange>> {
        if self.state == next {
            return Ok(None);
        }
        if !self.state.can_transition_to(next) {
            return Err(WalletError::InvalidTransition(format!(
                "transaction {} cannot move from {} to {}",
                self.txid, self.state, next
            )));
        }
        let change = StateChange {
            txid: self.txid.clone(),
            from: self.state,
            to: next,
            confirmations: self.confirmations,
        };
        self.state = next;
        Ok(Some(change))
    }
}

/// A transition observed during a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub txid: String,
    pub from: TxState,
    pub to: TxState,
    pub confirmations: u32,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub required_confirmations: u32,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub not_found_window: ChronoDuration,
}

impl From<&TrackingConfig> for TrackingSettings {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            required_confirmations: config.required_confirmations,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_poll_interval: Duration::from_secs(config.max_poll_interval_secs),
            not_found_window: ChronoDuration::seconds(config.not_found_window_secs as i64),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackerDocument {
    version: u32,
    transactions: Vec<TrackedTransaction>,
}

struct TrackerInner {
    transactions: Vec<TrackedTransaction>,
    interval: Duration,
}

pub struct ConfirmationTracker {
    path: PathBuf,
    settings: TrackingSettings,
    gateway: Arc<FailoverGateway>,
    inner: Mutex<TrackerInner>,
}

impl ConfirmationTracker {
    pub fn open(data_dir: &Path, settings: TrackingSettings, gateway: Arc<FailoverGateway>) -> WalletResult<Self> {
        let path = data_dir.join(files::TRACKED_TXS);
        let transactions = storage::read_json::<TrackerDocument>(&path)?
            .map(|doc| doc.transactions)
            .unwrap_or_default();

        Ok(Self {
            path,
            inner: Mutex::new(TrackerInner {
                transactions,
                interval: settings.poll_interval,
            }),
            settings,
            gateway,
        })
    }

    /// Drop finished transactions past retention; true when any were removed
    fn prune(inner: &mut TrackerInner, now: DateTime<Utc>) -> bool {
        let cutoff = now - ChronoDuration::days(FINISHED_RETENTION_DAYS);
        let before = inner.transactions.len();
        inner.transactions.retain(|t| !t.finished_before(cutoff));
        inner.transactions.len() != before
    }

    fn persist(&self, inner: &TrackerInner) -> WalletResult<()> {
        let doc = TrackerDocument {
            version: STATE_FORMAT_VERSION,
            transactions: inner.transactions.clone(),
        };
        storage::write_json_private(&self.path, &doc)
    }

    /// Start tracking a freshly broadcast transaction
    pub fn track(&self, txid: &str, recipient: &str, amount: u64, fee: u64) -> WalletResult<()> {
        let mut inner = lock_or_recover(&self.inner);
        if inner.transactions.iter().any(|t| t.txid == txid) {
            return Ok(());
        }
        let now = Utc::now();
        Self::prune(&mut inner, now);
        inner.transactions.push(TrackedTransaction {
            txid: txid.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            state: TxState::Pending,
            confirmations: 0,
            broadcast_at: now,
            last_checked: None,
            not_found_since: None,
            finished_at: None,
        });
        self.persist(&inner)
    }

    pub fn get(&self, txid: &str) -> Option<TrackedTransaction> {
        lock_or_recover(&self.inner)
            .transactions
            .iter()
            .find(|t| t.txid == txid)
            .cloned()
    }

    pub fn list(&self) -> Vec<TrackedTransaction> {
        lock_or_recover(&self.inner).transactions.clone()
    }

    /// Transactions that still need polling
    pub fn active(&self) -> Vec<TrackedTransaction> {
        lock_or_recover(&self.inner)
            .transactions
            .iter()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Delay before the next poll
    pub fn next_interval(&self) -> Duration {
        lock_or_recover(&self.inner).interval
    }

    pub fn poll_once(&self) -> WalletResult<Vec<StateChange>> {
        self.poll_once_at(Utc::now())
    }

    /// Query every active transaction once, as if the time were `now`
    pub fn poll_once_at(&self, now: DateTime<Utc>) -> WalletResult<Vec<StateChange>> {
        let active = self.active();
        if active.is_empty() {
            let mut inner = lock_or_recover(&self.inner);
            if Self::prune(&mut inner, now) {
                self.persist(&inner)?;
            }
            return Ok(Vec::new());
        }

        // Network calls happen without holding the tracker lock
        let answers: Vec<_> = active
            .iter()
            .map(|t| {
                let (result, route) = self.gateway.with_failover_report(|p| p.get_transaction(&t.txid));
                (t.txid.clone(), result, route.is_degraded())
            })
            .collect();

        let mut inner = lock_or_recover(&self.inner);
        let mut changes = Vec::new();
        let mut degraded_round = false;

        for (txid, result, degraded) in answers {
            let Some(tracked) = inner.transactions.iter_mut().find(|t| t.txid == txid) else {
                continue;
            };
            if tracked.state.is_terminal() {
                continue;
            }
            tracked.last_checked = Some(now);

            let next = match result {
                Ok(Some(status)) => {
                    degraded_round |= degraded;
                    tracked.not_found_since = None;
                    tracked.confirmations = status.confirmations;
                    if status.confirmations >= self.settings.required_confirmations {
                        TxState::Confirmed
                    } else if status.confirmations > 0 {
                        TxState::Confirming
                    } else {
                        TxState::Pending
                    }
                }
                Ok(None) if !degraded => {
                    let since = *tracked.not_found_since.get_or_insert(now);
                    if now - since >= self.settings.not_found_window {
                        TxState::Failed
                    } else {
                        tracked.state
                    }
                }
                Ok(None) | Err(_) => {
                    degraded_round = true;
                    TxState::Unverified
                }
            };

            if let Some(change) = tracked.transition(next)? {
                if change.to.is_terminal() {
                    tracked.finished_at = Some(now);
                }
                changes.push(change);
            }
        }
        Self::prune(&mut inner, now);

        inner.interval = if degraded_round {
            inner
                .interval
                .saturating_mul(2)
                .min(self.settings.max_poll_interval)
        } else {
            self.settings.poll_interval
        };

        self.persist(&inner)?;
        drop(inner);

        for change in &changes {
            let level = if change.to == TxState::Failed {
                LogLevel::Warn
            } else {
                LogLevel::Info
            };
            log_transaction(
                level,
                "transaction state changed",
                Some(json!({
                    "txid": change.txid,
                    "from": change.from.to_string(),
                    "to": change.to.to_string(),
                    "confirmations": change.confirmations,
                })),
            );
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_refuse_transitions() {
        assert!(!TxState::Confirmed.can_transition_to(TxState::Pending));
        assert!(!TxState::Failed.can_transition_to(TxState::Confirming));
        assert!(TxState::Unverified.can_transition_to(TxState::Failed));
        assert!(TxState::Pending.can_transition_to(TxState::Confirmed));
    }

    #[test]
    fn transition_from_terminal_is_an_error() {
        let mut tx = TrackedTransaction {
            txid: "t".into(),
            recipient: "r".into(),
            amount: 1,
            fee: 1,
            state: TxState::Confirmed,
            confirmations: 6,
            broadcast_at: Utc::now(),
            last_checked: None,
            not_found_since: None,
            finished_at: None,
        };
        assert!(tx.transition(TxState::Confirmed).unwrap().is_none());
        assert!(matches!(
            tx.transition(TxState::Failed),
            Err(WalletError::InvalidTransition(_))
        ));
    }
}
