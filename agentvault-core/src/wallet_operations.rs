//! The agent wallet facade
//!
//! # Security Model
//!
//! [`AgentWallet`] is the only surface the command/tool layer talks to. It
//! wires the components together in a fixed order: a spend request always
//! passes the policy gate before the pipeline sees it, and only the owner can
//! release a queued spend.
//!
//! ## Security Boundaries
//!
//! - Agent requests enter through [`AgentWallet::request_send`]; they can
//!   never skip the gate or decide approvals
//! - Owner decisions enter through [`AgentWallet::approve`] and
//!   [`AgentWallet::deny`], checked against the configured owner id
//! - Spends are serialized: evaluation, broadcast and limit recording happen
//!   under one lock so two requests cannot both fit under the same limit
//!
//! ## Background work
//!
//! [`AgentWallet::start_background_jobs`] starts the ledger refresh, the
//! confirmation poller and the approval expiry sweep. They stop on
//! [`AgentWallet::shutdown`] or when the wallet is dropped.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentvault_common::config::Config;
use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_core, LogLevel};
use agentvault_common::math::from_major;
use agentvault_common::storage;
use agentvault_common::types::{ChainParams, SecretBytes};

use crate::events::{audit, dispatch, AuditEntry, AuditLogger, LogAuditLogger, LogNotifier, Notifier, WalletEvent};
use crate::gateway::{ChainProvider, FailoverGateway, NetworkInfo, ProviderHealth, TxSummary};
use crate::key_vault::{KeyVault, VaultSettings};
use crate::policy::{
    ApprovalQueue, ApprovalStatus, LimitTracker, LimitUsage, PendingApproval, PolicyGate, PolicySettings,
    SpendAction, AUTO_TIMEOUT_ACTOR,
};
use crate::scheduler::RepeatingJob;
use crate::transaction::{
    ConfirmationTracker, PipelineSettings, RetryPolicy, SentTransaction, StateChange, TrackedTransaction,
    TrackingSettings, TransactionPipeline, TxState,
};
use crate::utxo_management::{ConsolidationAdvice, LedgerBalance, RefreshReport, UtxoLedger};
use crate::utxo_selection::CoinSelector;
use crate::lock_or_recover;

/// Initiator recorded for agent-originated actions
pub const AGENT_INITIATOR: &str = "agent";

const APPROVAL_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Result of a spend request that passed the gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent(SentTransaction),
    PendingApproval(PendingApproval),
}

/// Shared state behind the facade and its background jobs
struct WalletCore {
    chain: ChainParams,
    config: Config,
    vault: Arc<KeyVault>,
    ledger: Arc<UtxoLedger>,
    gateway: Arc<FailoverGateway>,
    tracker: Arc<ConfirmationTracker>,
    pipeline: TransactionPipeline,
    gate: PolicyGate,
    approvals: ApprovalQueue,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditLogger>,
    send_lock: Mutex<()>,
}

impl WalletCore {
    fn refresh(&self) -> WalletResult<RefreshReport> {
        let address = self.vault.address()?;
        let report = self.ledger.refresh(self.gateway.as_ref(), &address)?;

        let mut received: BTreeMap<&str, u64> = BTreeMap::new();
        for utxo in &report.received {
            *received.entry(utxo.txid.as_str()).or_default() += utxo.amount;
        }
        for (txid, amount) in received {
            dispatch(
                self.notifier.as_ref(),
                &WalletEvent::Received {
                    txid: txid.to_string(),
                    amount,
                },
            );
        }
        Ok(report)
    }

    /// Broadcast a spend the gate already allowed, then record it
    fn execute(&self, recipient: &str, amount: u64, tier: &str, initiator: &str, notify: bool) -> WalletResult<SentTransaction> {
        let sent = match self.pipeline.send(recipient, amount) {
            Ok(sent) => sent,
            Err(e) => {
                audit(
                    self.audit.as_ref(),
                    AuditEntry::new("send_failed", e.to_string(), initiator)
                        .with_amount(amount)
                        .with_tier(tier),
                );
                return Err(e);
            }
        };

        if let Err(e) = self.gate.record_spend(amount, &sent.txid) {
            log_core(
                LogLevel::Error,
                "failed to record spend against limits",
                Some(json!({"txid": sent.txid, "error": e.to_string()})),
            );
        }

        audit(
            self.audit.as_ref(),
            AuditEntry::new("send", "broadcast", initiator)
                .with_txid(&sent.txid)
                .with_amount(amount)
                .with_tier(tier),
        );
        if notify {
            dispatch(
                self.notifier.as_ref(),
                &WalletEvent::Sent {
                    txid: sent.txid.clone(),
                    recipient: recipient.to_string(),
                    amount,
                    fee: sent.fee,
                },
            );
        }
        Ok(sent)
    }

    /// Execute an approved queue entry after re-checking freeze, denylist and caps
    fn execute_approved(&self, entry: &PendingApproval, initiator: &str) -> WalletResult<SentTransaction> {
        let _serial = lock_or_recover(&self.send_lock);

        let blocked = self.gate.check_recipient(&entry.recipient).or_else(|| {
            let others = self.approvals.outstanding(Some(&entry.id));
            self.gate.check_limits(entry.amount, &entry.tier, others)
        });
        if let Some(denied) = blocked {
            audit(
                self.audit.as_ref(),
                AuditEntry::new("approval_blocked", denied.reason.clone(), initiator)
                    .with_amount(entry.amount)
                    .with_tier(&entry.tier),
            );
            return Err(denied.into_error());
        }

        let sent = self.execute(&entry.recipient, entry.amount, &entry.tier, initiator, true)?;
        if let Err(e) = self.approvals.mark_executed(&entry.id, &sent.txid) {
            log_core(
                LogLevel::Error,
                "failed to mark approval executed",
                Some(json!({"id": entry.id, "error": e.to_string()})),
            );
        }
        Ok(sent)
    }

    fn process_expired(&self) -> WalletResult<Vec<PendingApproval>> {
        let changed = self.approvals.sweep_expired()?;
        let mut results = Vec::with_capacity(changed.len());

        for entry in changed {
            match entry.status {
                ApprovalStatus::Approved => {
                    if let Err(e) = self.execute_approved(&entry, AUTO_TIMEOUT_ACTOR) {
                        log_core(
                            LogLevel::Warn,
                            "delayed spend could not be executed",
                            Some(json!({"id": entry.id, "error": e.to_string()})),
                        );
                    }
                }
                _ => {
                    audit(
                        self.audit.as_ref(),
                        AuditEntry::new("approval_expired", "no owner decision before expiry", AUTO_TIMEOUT_ACTOR)
                            .with_amount(entry.amount)
                            .with_tier(&entry.tier),
                    );
                }
            }
            results.push(self.approvals.get(&entry.id).unwrap_or(entry));
        }
        Ok(results)
    }

    fn poll_confirmations(&self) -> WalletResult<Vec<StateChange>> {
        let changes = self.tracker.poll_once()?;
        for change in &changes {
            match change.to {
                TxState::Failed => {
                    if let Err(e) = self.ledger.release_failed(&change.txid) {
                        log_core(
                            LogLevel::Error,
                            "failed to release inputs of failed transaction",
                            Some(json!({"txid": change.txid, "error": e.to_string()})),
                        );
                    }
                    audit(
                        self.audit.as_ref(),
                        AuditEntry::new("transaction_failed", "not seen by providers", "system")
                            .with_txid(&change.txid),
                    );
                    dispatch(
                        self.notifier.as_ref(),
                        &WalletEvent::TransactionFailed {
                            txid: change.txid.clone(),
                        },
                    );
                }
                TxState::Confirmed => dispatch(
                    self.notifier.as_ref(),
                    &WalletEvent::TransactionConfirmed {
                        txid: change.txid.clone(),
                        confirmations: change.confirmations,
                    },
                ),
                _ => {}
            }
        }
        Ok(changes)
    }
}

/// Agent-custodied wallet
pub struct AgentWallet {
    core: Arc<WalletCore>,
    jobs: Mutex<Vec<RepeatingJob>>,
}

impl AgentWallet {
    /// Load the TOML configuration at `path` and open the wallet it describes
    pub fn load(path: &Path) -> WalletResult<Self> {
        let config = Config::load(path).map_err(|e| WalletError::Config(format!("{:#}", e)))?;
        let gateway = Arc::new(FailoverGateway::from_config(&config.gateway)?);
        Self::open(config, gateway)
    }

    /// Open with log-backed notifier and audit logger
    pub fn open(config: Config, gateway: Arc<FailoverGateway>) -> WalletResult<Self> {
        Self::with_observers(config, gateway, Arc::new(LogNotifier), Arc::new(LogAuditLogger))
    }

    pub fn with_observers(
        config: Config,
        gateway: Arc<FailoverGateway>,
        notifier: Arc<dyn Notifier>,
        audit_logger: Arc<dyn AuditLogger>,
    ) -> WalletResult<Self> {
        config
            .validate()
            .map_err(|e| WalletError::Config(format!("{:#}", e)))?;

        let chain = config.wallet.network.params();
        let data_dir = config.wallet.data_dir.clone();
        storage::ensure_private_dir(&data_dir)?;

        let vault = Arc::new(KeyVault::new(VaultSettings::from_config(
            &data_dir,
            chain.clone(),
            &config.vault,
        ))?);
        let ledger = Arc::new(UtxoLedger::open(&data_dir, CoinSelector::new(chain.dust_threshold))?);
        let tracker = Arc::new(ConfirmationTracker::open(
            &data_dir,
            TrackingSettings::from(&config.tracking),
            gateway.clone(),
        )?);

        let max_fee = from_major(config.fees.max_fee, chain.minor_per_major)?;
        let pipeline = TransactionPipeline::new(
            chain.clone(),
            vault.clone(),
            ledger.clone(),
            gateway.clone(),
            tracker.clone(),
            PipelineSettings {
                fee_speed: config.fees.speed,
                fallback_fee_rate: config.fees.fallback_rate,
                fee_ceiling: max_fee.saturating_mul(2),
                min_confirmations: config.ledger.min_confirmations,
                retry: RetryPolicy::from(&config.broadcast),
            },
        );

        let limits = Arc::new(LimitTracker::open(&data_dir)?);
        let gate = PolicyGate::open(
            &data_dir,
            PolicySettings::from_config(&config.policy, chain.minor_per_major)?,
            limits,
        )?;
        let approvals = ApprovalQueue::open(&data_dir, &config.wallet.owner_id)?;

        log_core(
            LogLevel::Info,
            "wallet opened",
            Some(json!({
                "network": chain.network.as_str(),
                "initialized": vault.is_initialized(),
                "providers": gateway.provider_names().join(","),
            })),
        );

        Ok(Self {
            core: Arc::new(WalletCore {
                chain,
                config,
                vault,
                ledger,
                gateway,
                tracker,
                pipeline,
                gate,
                approvals,
                notifier,
                audit: audit_logger,
                send_lock: Mutex::new(()),
            }),
            jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn chain(&self) -> &ChainParams {
        &self.core.chain
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    // Vault

    /// Create a new wallet; the returned phrase is shown once and never stored
    pub fn init(&self, passphrase: SecretBytes) -> WalletResult<SecretBytes> {
        let phrase = self.core.vault.init(passphrase)?;
        audit(self.core.audit.as_ref(), AuditEntry::new("wallet_init", "new wallet", &self.core.config.wallet.owner_id));
        Ok(phrase)
    }

    pub fn recover(&self, phrase: SecretBytes, passphrase: SecretBytes) -> WalletResult<String> {
        let address = self.core.vault.recover(phrase, passphrase)?;
        audit(
            self.core.audit.as_ref(),
            AuditEntry::new("wallet_recover", "restored from phrase", &self.core.config.wallet.owner_id),
        );
        Ok(address)
    }

    pub fn unlock(&self, passphrase: SecretBytes) -> WalletResult<()> {
        self.core.vault.unlock(passphrase)
    }

    pub fn lock(&self) {
        self.core.vault.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.core.vault.is_initialized()
    }

    pub fn is_unlocked(&self) -> bool {
        self.core.vault.is_unlocked()
    }

    pub fn address(&self) -> WalletResult<String> {
        self.core.vault.address()
    }

    pub fn change_passphrase(&self, old: SecretBytes, new: SecretBytes) -> WalletResult<()> {
        self.core.vault.change_passphrase(old, new)
    }

    // Ledger

    pub fn refresh(&self) -> WalletResult<RefreshReport> {
        self.core.refresh()
    }

    pub fn balance(&self) -> LedgerBalance {
        self.core.ledger.balance()
    }

    pub fn consolidation_advice(&self) -> Option<ConsolidationAdvice> {
        let rate = self.core.pipeline.current_fee_rate();
        self.core
            .ledger
            .consolidation_advice(rate, self.core.config.ledger.consolidation_threshold)
    }

    pub fn history(&self, limit: usize) -> WalletResult<Vec<TxSummary>> {
        let address = self.address()?;
        self.core.gateway.get_transactions(&address, limit)
    }

    // Spending

    /// Ask to pay `amount` minor units to `recipient`
    ///
    /// # Errors
    ///
    /// - `InvalidAddress` before any policy evaluation
    /// - `PolicyDenied` when the gate refuses the spend
    /// - Any pipeline error for an immediately executed spend
    pub fn request_send(&self, recipient: &str, amount: u64) -> WalletResult<SendOutcome> {
        crate::address::decode_address(recipient, &self.core.chain)?;
        let core = &self.core;
        let _serial = lock_or_recover(&core.send_lock);

        let decision = core.gate.evaluate_reserved(amount, recipient, core.approvals.outstanding(None));
        if !decision.allowed {
            audit(
                core.audit.as_ref(),
                AuditEntry::new("policy_denied", decision.reason.clone(), AGENT_INITIATOR)
                    .with_amount(amount)
                    .with_tier(&decision.tier),
            );
            dispatch(
                core.notifier.as_ref(),
                &WalletEvent::PolicyBlocked {
                    recipient: recipient.to_string(),
                    amount,
                    reason: decision.reason.clone(),
                },
            );
            return Err(decision.into_error());
        }

        if decision.action.is_queued() {
            let hold = core
                .gate
                .settings()
                .tiers
                .iter()
                .find(|t| t.name == decision.tier)
                .and_then(|t| t.delay)
                .unwrap_or(core.gate.settings().approval_timeout);
            let entry = core.approvals.enqueue(recipient, amount, &decision, hold)?;

            audit(
                core.audit.as_ref(),
                AuditEntry::new("approval_requested", decision.action.as_str(), AGENT_INITIATOR)
                    .with_amount(amount)
                    .with_tier(&decision.tier),
            );
            dispatch(
                core.notifier.as_ref(),
                &WalletEvent::ApprovalNeeded {
                    id: entry.id.clone(),
                    recipient: recipient.to_string(),
                    amount,
                    tier: entry.tier.clone(),
                    expires_at: entry.expires_at,
                },
            );
            return Ok(SendOutcome::PendingApproval(entry));
        }

        let notify = decision.action == SpendAction::AutoNotify;
        core.execute(recipient, amount, &decision.tier, AGENT_INITIATOR, notify)
            .map(SendOutcome::Sent)
    }

    /// Owner approval of a queued spend; executes it immediately
    pub fn approve(&self, id: &str, caller: &str) -> WalletResult<SentTransaction> {
        let entry = self.core.approvals.approve(id, caller)?;
        self.core.execute_approved(&entry, caller)
    }

    /// Retry an approved entry whose execution failed earlier
    pub fn execute_approval(&self, id: &str, caller: &str) -> WalletResult<SentTransaction> {
        if caller != self.core.config.wallet.owner_id {
            return Err(WalletError::ApprovalUnauthorized);
        }
        let entry = self
            .core
            .approvals
            .get(id)
            .ok_or_else(|| WalletError::ApprovalNotFound(id.to_string()))?;
        if entry.status != ApprovalStatus::Approved {
            return Err(WalletError::InvalidTransition(format!(
                "approval {} is {}, not approved",
                id, entry.status
            )));
        }
        self.core.execute_approved(&entry, caller)
    }

    pub fn deny(&self, id: &str, caller: &str) -> WalletResult<PendingApproval> {
        let entry = self.core.approvals.deny(id, caller)?;
        audit(
            self.core.audit.as_ref(),
            AuditEntry::new("approval_denied", "owner decision", caller)
                .with_amount(entry.amount)
                .with_tier(&entry.tier),
        );
        Ok(entry)
    }

    /// Apply timeouts: delayed spends go out, unanswered approvals expire
    pub fn process_expired(&self) -> WalletResult<Vec<PendingApproval>> {
        self.core.process_expired()
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.core.approvals.list_pending()
    }

    pub fn approval(&self, id: &str) -> Option<PendingApproval> {
        self.core.approvals.get(id)
    }

    // Policy

    pub fn freeze(&self, reason: &str) -> WalletResult<()> {
        self.core.gate.freeze(reason)?;
        audit(
            self.core.audit.as_ref(),
            AuditEntry::new("freeze", reason, &self.core.config.wallet.owner_id),
        );
        dispatch(
            self.core.notifier.as_ref(),
            &WalletEvent::Frozen {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    pub fn unfreeze(&self) -> WalletResult<()> {
        self.core.gate.unfreeze()?;
        audit(
            self.core.audit.as_ref(),
            AuditEntry::new("unfreeze", "owner request", &self.core.config.wallet.owner_id),
        );
        dispatch(self.core.notifier.as_ref(), &WalletEvent::Unfrozen);
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.core.gate.is_frozen()
    }

    pub fn limit_usage(&self) -> LimitUsage {
        self.core.gate.limits().usage()
    }

    // Tracking and network

    pub fn poll_confirmations(&self) -> WalletResult<Vec<StateChange>> {
        self.core.poll_confirmations()
    }

    pub fn tracked_transactions(&self) -> Vec<TrackedTransaction> {
        self.core.tracker.list()
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.core.gateway.health_snapshot()
    }

    pub fn network_info(&self) -> WalletResult<NetworkInfo> {
        self.core.gateway.get_network_info()
    }

    // Background jobs

    pub fn start_background_jobs(&self) -> WalletResult<()> {
        let mut jobs = lock_or_recover(&self.jobs);
        if !jobs.is_empty() {
            return Ok(());
        }

        let core = self.core.clone();
        jobs.push(RepeatingJob::start(
            "ledger-refresh",
            Duration::from_secs(self.core.config.ledger.refresh_interval_secs),
            move || {
                if !core.vault.is_initialized() {
                    return;
                }
                if let Err(e) = core.refresh() {
                    log_core(LogLevel::Warn, "background refresh failed", Some(json!({"error": e.kind()})));
                }
            },
        )?);

        let core = self.core.clone();
        jobs.push(RepeatingJob::start_adaptive(
            "confirmations",
            core.tracker.next_interval(),
            move || {
                if let Err(e) = core.poll_confirmations() {
                    log_core(LogLevel::Warn, "confirmation poll failed", Some(json!({"error": e.kind()})));
                }
                core.tracker.next_interval()
            },
        )?);

        let core = self.core.clone();
        jobs.push(RepeatingJob::start("approval-expiry", APPROVAL_SWEEP_INTERVAL, move || {
            if let Err(e) = core.process_expired() {
                log_core(LogLevel::Warn, "approval sweep failed", Some(json!({"error": e.kind()})));
            }
        })?);

        Ok(())
    }

    /// Stop background jobs and lock the vault
    pub fn shutdown(&self) {
        let mut jobs = lock_or_recover(&self.jobs);
        for job in jobs.iter_mut() {
            job.stop();
        }
        jobs.clear();
        self.core.vault.lock();
    }
}

impl Drop for AgentWallet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
