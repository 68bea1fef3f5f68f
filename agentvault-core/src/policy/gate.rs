//! Policy gate
//!
//! Evaluation order, first match wins:
//!
//! 1. Global freeze
//! 2. Denylisted recipient
//! 3. Zero amount
//! 4. Allowlisted recipient (action `auto`) or tier lookup
//! 5. Tier action `deny`
//! 6. Daily cap, hourly cap, daily transaction count, cooldown
//!
//! Caps are checked against recorded spends plus a [`Reservation`] for
//! spends already queued, so queued requests cannot add up past a limit.
//! The gate only classifies. Queuing, execution and spend recording are done
//! by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agentvault_common::error::WalletResult;
use agentvault_common::logging::{log_policy, LogLevel};
use agentvault_common::storage;
use agentvault_common::version::STATE_FORMAT_VERSION;

use super::limits::{LimitTracker, Reservation};
use super::{PolicyDecision, PolicySettings, SpendAction};
use crate::{files, lock_or_recover};

const ALLOWLIST_TIER: &str = "allowlist";
const NO_TIER: &str = "none";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyState {
    version: u32,
    frozen: bool,
    frozen_at: Option<DateTime<Utc>>,
    freeze_reason: Option<String>,
}

pub struct PolicyGate {
    settings: PolicySettings,
    limits: Arc<LimitTracker>,
    state_path: PathBuf,
    state: Mutex<PolicyState>,
}

impl PolicyGate {
    pub fn open(data_dir: &Path, settings: PolicySettings, limits: Arc<LimitTracker>) -> WalletResult<Self> {
        let state_path = data_dir.join(files::POLICY_STATE);
        let state = storage::read_json::<PolicyState>(&state_path)?.unwrap_or_default();
        Ok(Self {
            settings,
            limits,
            state_path,
            state: Mutex::new(state),
        })
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn limits(&self) -> &Arc<LimitTracker> {
        &self.limits
    }

    pub fn evaluate(&self, amount: u64, recipient: &str) -> PolicyDecision {
        self.evaluate_at(amount, recipient, Utc::now())
    }

    pub fn evaluate_at(&self, amount: u64, recipient: &str, now: DateTime<Utc>) -> PolicyDecision {
        self.evaluate_reserved_at(amount, recipient, Reservation::default(), now)
    }

    /// Evaluate with `reserved` counted as already spent
    pub fn evaluate_reserved(&self, amount: u64, recipient: &str, reserved: Reservation) -> PolicyDecision {
        self.evaluate_reserved_at(amount, recipient, reserved, Utc::now())
    }

    pub fn evaluate_reserved_at(
        &self,
        amount: u64,
        recipient: &str,
        reserved: Reservation,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        let decision = self.classify(amount, recipient, reserved, now);
        let level = if decision.allowed {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };
        log_policy(
            level,
            "spend evaluated",
            Some(json!({
                "amount": amount,
                "tier": decision.tier,
                "action": decision.action.as_str(),
                "allowed": decision.allowed,
                "reason": decision.reason,
            })),
        );
        decision
    }

    fn classify(&self, amount: u64, recipient: &str, reserved: Reservation, now: DateTime<Utc>) -> PolicyDecision {
        if let Some(denied) = self.check_recipient(recipient) {
            return denied;
        }
        if amount == 0 {
            return PolicyDecision::deny(NO_TIER, "amount must be greater than zero");
        }

        let (tier, action) = if self.settings.allowlist.contains(recipient) {
            (ALLOWLIST_TIER.to_string(), SpendAction::Auto)
        } else {
            match self.settings.tier_for(amount) {
                Some(tier) => (tier.name.clone(), tier.action),
                None => return PolicyDecision::deny(NO_TIER, "amount exceeds the highest tier"),
            }
        };

        if action == SpendAction::Deny {
            return PolicyDecision::deny(&tier, format!("tier {} does not allow spending", tier));
        }

        if let Some(reason) = self.limit_violation(amount, reserved, now) {
            return PolicyDecision::deny(&tier, reason);
        }
        if let Some(reason) = self.cooldown_violation(now) {
            return PolicyDecision::deny(&tier, reason);
        }

        PolicyDecision::allow(&tier, action, "within policy")
    }

    fn limit_violation(&self, amount: u64, reserved: Reservation, now: DateTime<Utc>) -> Option<String> {
        let usage = self.limits.usage_at(now);
        let daily = usage.daily_total.saturating_add(reserved.amount);
        let hourly = usage.hourly_total.saturating_add(reserved.amount);

        if daily.saturating_add(amount) > self.settings.daily_limit {
            return Some(format!(
                "daily limit exceeded: {} spent or queued, {} requested, limit {}",
                daily, amount, self.settings.daily_limit
            ));
        }
        if hourly.saturating_add(amount) > self.settings.hourly_limit {
            return Some(format!(
                "hourly limit exceeded: {} spent or queued, {} requested, limit {}",
                hourly, amount, self.settings.hourly_limit
            ));
        }
        if usage.daily_count.saturating_add(reserved.count) >= self.settings.max_daily_transactions {
            return Some(format!(
                "daily transaction count reached ({})",
                self.settings.max_daily_transactions
            ));
        }
        None
    }

    fn cooldown_violation(&self, now: DateTime<Utc>) -> Option<String> {
        let last = self.limits.usage_at(now).last_spend?;
        let elapsed = (now - last).to_std().unwrap_or_default();
        if elapsed < self.settings.cooldown {
            let wait = (self.settings.cooldown - elapsed).as_secs().max(1);
            return Some(format!("cooldown active, retry in {}s", wait));
        }
        None
    }

    /// Caps and transaction count for a queued spend about to execute
    ///
    /// `reserved` must not include the spend itself. The cooldown does not
    /// apply: the timing of an approved spend is not the agent's.
    pub fn check_limits(&self, amount: u64, tier: &str, reserved: Reservation) -> Option<PolicyDecision> {
        self.check_limits_at(amount, tier, reserved, Utc::now())
    }

    pub fn check_limits_at(
        &self,
        amount: u64,
        tier: &str,
        reserved: Reservation,
        now: DateTime<Utc>,
    ) -> Option<PolicyDecision> {
        self.limit_violation(amount, reserved, now)
            .map(|reason| PolicyDecision::deny(tier, reason))
    }

    /// Freeze and denylist checks, shared with approval execution
    pub fn check_recipient(&self, recipient: &str) -> Option<PolicyDecision> {
        if self.is_frozen() {
            return Some(PolicyDecision::deny(NO_TIER, "wallet is frozen"));
        }
        if self.settings.denylist.contains(recipient) {
            return Some(PolicyDecision::deny(NO_TIER, "recipient is denylisted"));
        }
        None
    }

    pub fn is_frozen(&self) -> bool {
        lock_or_recover(&self.state).frozen
    }

    pub fn freeze(&self, reason: &str) -> WalletResult<()> {
        self.update_state(|state| {
            state.frozen = true;
            state.frozen_at = Some(Utc::now());
            state.freeze_reason = Some(reason.to_string());
        })?;
        log_policy(LogLevel::Warn, "wallet frozen", Some(json!({"reason": reason})));
        Ok(())
    }

    pub fn unfreeze(&self) -> WalletResult<()> {
        self.update_state(|state| {
            state.frozen = false;
            state.frozen_at = None;
            state.freeze_reason = None;
        })?;
        log_policy(LogLevel::Info, "wallet unfrozen", None);
        Ok(())
    }

    /// Persist the changed state first; memory only follows a successful write
    fn update_state<F>(&self, change: F) -> WalletResult<()>
    where
        F: FnOnce(&mut PolicyState),
    {
        let mut state = lock_or_recover(&self.state);
        let mut next = state.clone();
        next.version = STATE_FORMAT_VERSION;
        change(&mut next);
        storage::write_json_private(&self.state_path, &next)?;
        *state = next;
        Ok(())
    }

    /// Record a completed spend against the limits
    pub fn record_spend(&self, amount: u64, txid: &str) -> WalletResult<()> {
        self.limits.record(amount, Some(txid))
    }
}
