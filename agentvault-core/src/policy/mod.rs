//! Spending policy: tiers, limits and owner approvals
//!
//! Every spend request is classified by amount into a tier; the tier's
//! action decides whether it goes out immediately, after a delay, after an
//! explicit owner decision, or never. Rolling limits and a cooldown apply on
//! top of the tier, including for allowlisted recipients.
//!
//! This module does no networking and touches no keys.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use agentvault_common::config::PolicyConfig;
use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::math::from_major;

pub mod approvals;
pub mod gate;
pub mod limits;

pub use approvals::{ApprovalQueue, ApprovalStatus, PendingApproval, AUTO_TIMEOUT_ACTOR};
pub use gate::PolicyGate;
pub use limits::{LimitTracker, LimitUsage, Reservation, SpendRecord};

/// What happens to a spend that falls into a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendAction {
    Auto,
    AutoNotify,
    /// Queued; goes out when the delay elapses unless the owner denies it
    Delay,
    #[serde(rename = "approve")]
    OwnerApproval,
    #[serde(rename = "confirm")]
    OwnerConfirmation,
    Deny,
}

impl SpendAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpendAction::Auto => "auto",
            SpendAction::AutoNotify => "auto_notify",
            SpendAction::Delay => "delay",
            SpendAction::OwnerApproval => "approve",
            SpendAction::OwnerConfirmation => "confirm",
            SpendAction::Deny => "deny",
        }
    }

    /// Spends that must pass through the approval queue
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            SpendAction::Delay | SpendAction::OwnerApproval | SpendAction::OwnerConfirmation
        )
    }
}

impl fmt::Display for SpendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpendAction {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SpendAction::Auto),
            "auto_notify" => Ok(SpendAction::AutoNotify),
            "delay" => Ok(SpendAction::Delay),
            "approve" => Ok(SpendAction::OwnerApproval),
            "confirm" => Ok(SpendAction::OwnerConfirmation),
            "deny" => Ok(SpendAction::Deny),
            other => Err(WalletError::Config(format!("unknown tier action: {}", other))),
        }
    }
}

/// A tier with its inclusive upper bound in minor units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name: String,
    pub max_amount: u64,
    pub action: SpendAction,
    /// Wait before a queued spend expires (or, for `delay`, goes out)
    pub delay: Option<Duration>,
}

/// Outcome of evaluating a spend request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub tier: String,
    pub action: SpendAction,
    pub reason: String,
}

impl PolicyDecision {
    pub(crate) fn allow(tier: &str, action: SpendAction, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            tier: tier.to_string(),
            action,
            reason: reason.into(),
        }
    }

    pub(crate) fn deny(tier: &str, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            tier: tier.to_string(),
            action: SpendAction::Deny,
            reason: reason.into(),
        }
    }

    /// Turn a refusal into the error surfaced to callers
    pub fn into_error(self) -> WalletError {
        WalletError::PolicyDenied {
            tier: self.tier,
            reason: self.reason,
        }
    }
}

/// Policy configuration converted to minor units
#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub tiers: Vec<Tier>,
    pub daily_limit: u64,
    pub hourly_limit: u64,
    pub max_daily_transactions: u32,
    pub cooldown: Duration,
    pub approval_timeout: Duration,
    pub allowlist: HashSet<String>,
    pub denylist: HashSet<String>,
}

impl PolicySettings {
    pub fn from_config(config: &PolicyConfig, minor_per_major: u64) -> WalletResult<Self> {
        let tiers = config
            .tiers
            .iter()
            .map(|t| {
                Ok(Tier {
                    name: t.name.clone(),
                    max_amount: from_major(t.max_amount, minor_per_major)?,
                    action: t.action.parse()?,
                    delay: t.delay_secs.map(Duration::from_secs),
                })
            })
            .collect::<WalletResult<Vec<_>>>()?;

        Ok(Self {
            tiers,
            daily_limit: from_major(config.daily_limit, minor_per_major)?,
            hourly_limit: from_major(config.hourly_limit, minor_per_major)?,
            max_daily_transactions: config.max_daily_transactions,
            cooldown: Duration::from_secs(config.cooldown_secs),
            approval_timeout: Duration::from_secs(config.approval_timeout_secs),
            allowlist: config.allowlist.iter().cloned().collect(),
            denylist: config.denylist.iter().cloned().collect(),
        })
    }

    /// First tier whose inclusive bound covers `amount`
    pub fn tier_for(&self, amount: u64) -> Option<&Tier> {
        self.tiers.iter().find(|t| amount <= t.max_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_converts_to_minor_units() {
        let settings = PolicySettings::from_config(&PolicyConfig::default(), 100_000_000).unwrap();
        assert_eq!(settings.tiers[0].name, "micro");
        assert_eq!(settings.tiers[0].max_amount, 10 * 100_000_000);
        assert_eq!(settings.tiers[2].action, SpendAction::Delay);
        assert_eq!(settings.daily_limit, 5_000 * 100_000_000);
    }

    #[test]
    fn action_names_round_trip_through_serde() {
        let json = serde_json::to_string(&SpendAction::OwnerApproval).unwrap();
        assert_eq!(json, "\"approve\"");
        assert_eq!("auto_notify".parse::<SpendAction>().unwrap(), SpendAction::AutoNotify);
        assert!("maybe".parse::<SpendAction>().is_err());
    }
}
