//! Health-aware routing over redundant providers
//!
//! Each call tries providers in configuration order, eligible ones first:
//! a provider is eligible while healthy or once its cooldown has elapsed.
//! Providers still cooling down are appended last rather than skipped, so a
//! request only fails when every provider has actually been tried.

use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agentvault_common::config::GatewayConfig;
use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_network, LogLevel};

use super::blockcypher::{BlockCypherProvider, PROVIDER_KIND as BLOCKCYPHER};
use super::{ChainProvider, NetworkInfo, ProviderUtxo, TxStatus, TxSummary};
use crate::lock_or_recover;

#[derive(Debug, Clone, Default)]
struct HealthState {
    healthy: bool,
    consecutive_failures: u32,
    last_error: Option<String>,
    unhealthy_until: Option<Instant>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.healthy || self.unhealthy_until.map(|until| now >= until).unwrap_or(true)
    }
}

/// Point-in-time view of one provider's health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Seconds left before the provider is retried first again
    pub cooldown_remaining_secs: Option<u64>,
}

/// Outcome of one routed call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Provider that answered, if any did
    pub served_by: Option<String>,
    /// Providers that failed before an answer (or all of them)
    pub failed: Vec<String>,
}

impl RouteReport {
    /// True when the answer did not come from the first provider tried
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Single [`ChainProvider`] over an ordered list of providers
pub struct FailoverGateway {
    providers: Vec<Arc<dyn ChainProvider>>,
    health: Mutex<Vec<HealthState>>,
    cooldown: Duration,
}

impl FailoverGateway {
    pub fn new(providers: Vec<Arc<dyn ChainProvider>>, cooldown: Duration) -> WalletResult<Self> {
        if providers.is_empty() {
            return Err(WalletError::Config("gateway needs at least one provider".into()));
        }
        let health = providers.iter().map(|_| HealthState::new()).collect();
        Ok(Self {
            providers,
            health: Mutex::new(health),
            cooldown,
        })
    }

    /// Build the configured HTTP providers
    pub fn from_config(config: &GatewayConfig) -> WalletResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut providers: Vec<Arc<dyn ChainProvider>> = Vec::with_capacity(config.providers.len());
        for provider in &config.providers {
            match provider.kind.as_str() {
                BLOCKCYPHER => providers.push(Arc::new(BlockCypherProvider::new(provider, timeout)?)),
                other => {
                    return Err(WalletError::Config(format!(
                        "provider {} has unknown kind '{}'",
                        provider.name, other
                    )))
                }
            }
        }
        Self::new(providers, Duration::from_secs(config.unhealthy_cooldown_secs))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        let now = Instant::now();
        let health = lock_or_recover(&self.health);
        self.providers
            .iter()
            .zip(health.iter())
            .map(|(provider, state)| ProviderHealth {
                name: provider.name().to_string(),
                healthy: state.healthy,
                consecutive_failures: state.consecutive_failures,
                last_error: state.last_error.clone(),
                cooldown_remaining_secs: state
                    .unhealthy_until
                    .filter(|until| *until > now)
                    .map(|until| (until - now).as_secs()),
            })
            .collect()
    }

    /// True when any provider is currently marked unhealthy
    pub fn is_degraded(&self) -> bool {
        lock_or_recover(&self.health).iter().any(|s| !s.healthy)
    }

    fn attempt_order(&self) -> Vec<usize> {
        let now = Instant::now();
        let health = lock_or_recover(&self.health);
        let (mut eligible, cooling): (Vec<usize>, Vec<usize>) =
            (0..self.providers.len()).partition(|&i| health[i].is_eligible(now));
        eligible.extend(cooling);
        eligible
    }

    fn record_success(&self, index: usize) {
        let mut health = lock_or_recover(&self.health);
        let state = &mut health[index];
        if !state.healthy {
            log_network(
                LogLevel::Info,
                "provider recovered",
                Some(json!({"provider": self.providers[index].name()})),
            );
        }
        *state = HealthState::new();
    }

    fn record_failure(&self, index: usize, err: &WalletError) {
        let cooldown = match err {
            WalletError::RateLimited {
                retry_after: Some(secs),
                ..
            } => self.cooldown.max(Duration::from_secs(*secs)),
            _ => self.cooldown,
        };

        let mut health = lock_or_recover(&self.health);
        let state = &mut health[index];
        state.healthy = false;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(err.to_string());
        state.unhealthy_until = Some(Instant::now() + cooldown);

        log_network(
            LogLevel::Warn,
            "provider failed",
            Some(json!({
                "provider": self.providers[index].name(),
                "kind": err.kind(),
                "consecutive_failures": state.consecutive_failures,
            })),
        );
    }

    /// Run `op` against providers until one succeeds
    pub fn with_failover<T, F>(&self, op: F) -> WalletResult<T>
    where
        F: Fn(&dyn ChainProvider) -> WalletResult<T>,
    {
        self.with_failover_report(op).0
    }

    /// Like [`with_failover`](Self::with_failover), also reporting who answered
    pub fn with_failover_report<T, F>(&self, op: F) -> (WalletResult<T>, RouteReport)
    where
        F: Fn(&dyn ChainProvider) -> WalletResult<T>,
    {
        let mut report = RouteReport::default();
        let mut last_error: Option<String> = None;

        for index in self.attempt_order() {
            let provider = &self.providers[index];
            match op(provider.as_ref()) {
                Ok(value) => {
                    self.record_success(index);
                    report.served_by = Some(provider.name().to_string());
                    return (Ok(value), report);
                }
                Err(err) => {
                    self.record_failure(index, &err);
                    report.failed.push(provider.name().to_string());
                    last_error = Some(err.to_string());
                }
            }
        }

        log_network(
            LogLevel::Error,
            "all providers failed",
            Some(json!({"attempted": report.failed.join(",")})),
        );
        let err = WalletError::ProviderUnavailable {
            attempted: report.failed.clone(),
            last_error,
        };
        (Err(err), report)
    }
}

impl ChainProvider for FailoverGateway {
    fn name(&self) -> &str {
        "failover"
    }

    fn get_balance(&self, address: &str) -> WalletResult<u64> {
        self.with_failover(|p| p.get_balance(address))
    }

    fn get_utxos(&self, address: &str) -> WalletResult<Vec<ProviderUtxo>> {
        self.with_failover(|p| p.get_utxos(address))
    }

    fn get_transaction(&self, txid: &str) -> WalletResult<Option<TxStatus>> {
        self.with_failover(|p| p.get_transaction(txid))
    }

    fn get_transactions(&self, address: &str, limit: usize) -> WalletResult<Vec<TxSummary>> {
        self.with_failover(|p| p.get_transactions(address, limit))
    }

    fn broadcast_tx(&self, raw_hex: &str) -> WalletResult<String> {
        self.with_failover(|p| p.broadcast_tx(raw_hex))
    }

    fn get_network_info(&self) -> WalletResult<NetworkInfo> {
        self.with_failover(|p| p.get_network_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockProvider;

    #[test]
    fn empty_provider_list_is_rejected() {
        assert!(FailoverGateway::new(Vec::new(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn unknown_provider_kind_is_a_config_error() {
        let mut config = GatewayConfig::default();
        config.providers[0].kind = "carrier-pigeon".into();
        assert!(matches!(
            FailoverGateway::from_config(&config),
            Err(WalletError::Config(_))
        ));
    }

    #[test]
    fn cooling_provider_moves_to_the_back() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        let gateway = FailoverGateway::new(
            vec![a.clone() as Arc<dyn ChainProvider>, b.clone()],
            Duration::from_secs(60),
        )
        .unwrap();

        a.fail_next("boom", 1);
        gateway.get_balance("D1").unwrap();
        assert_eq!(gateway.attempt_order(), vec![1, 0]);
    }
}
