//! BlockCypher REST provider
//!
//! Blocking HTTP client over the BlockCypher v1 API. Status codes are mapped
//! onto the gateway's error vocabulary: 429 becomes [`WalletError::RateLimited`]
//! (honouring `Retry-After`), a 404 on a transaction lookup is "not seen",
//! everything else non-2xx is a [`WalletError::ProviderError`].

use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use agentvault_common::config::ProviderConfig;
use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::logging::{log_network, LogLevel};

use super::{ChainProvider, FeeRates, NetworkInfo, ProviderUtxo, TxStatus, TxSummary};

pub const PROVIDER_KIND: &str = "blockcypher";

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    final_balance: i64,
}

#[derive(Debug, Deserialize)]
struct TxRef {
    tx_hash: String,
    #[serde(default)]
    tx_input_n: i64,
    #[serde(default)]
    tx_output_n: i64,
    value: u64,
    #[serde(default)]
    confirmations: u32,
    #[serde(default)]
    script: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    #[serde(default)]
    txrefs: Vec<TxRef>,
    #[serde(default)]
    unconfirmed_txrefs: Vec<TxRef>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    hash: String,
    #[serde(default)]
    confirmations: u32,
    #[serde(default)]
    block_height: i64,
}

#[derive(Debug, Deserialize)]
struct PushedTx {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    tx: PushedTx,
}

#[derive(Debug, Deserialize)]
struct ChainResponse {
    height: u64,
    low_fee_per_kb: u64,
    medium_fee_per_kb: u64,
    high_fee_per_kb: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Provider backed by `api.blockcypher.com` or a compatible endpoint
pub struct BlockCypherProvider {
    name: String,
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl BlockCypherProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> WalletResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("agentvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WalletError::Config(format!("http client for {}: {}", config.name, e)))?;

        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            client,
        })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        let mut params: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if let Some(token) = &self.token {
            params.push(format!("token={}", token));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }

    fn transport_error(&self, err: reqwest::Error) -> WalletError {
        let status = err.status().map(|s| s.as_u16());
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else {
            // Drop the URL: it may carry the API token
            err.without_url().to_string()
        };
        WalletError::ProviderError {
            provider: self.name.clone(),
            status,
            message,
        }
    }

    /// Map a non-success response onto a provider error
    fn status_error(&self, response: Response) -> WalletError {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return WalletError::RateLimited {
                provider: self.name.clone(),
                retry_after,
            };
        }

        let text = response.text().unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());

        WalletError::ProviderError {
            provider: self.name.clone(),
            status: Some(status.as_u16()),
            message,
        }
    }

    fn decode<T: DeserializeOwned>(&self, response: Response) -> WalletResult<T> {
        response.json::<T>().map_err(|e| WalletError::ProviderError {
            provider: self.name.clone(),
            status: None,
            message: format!("malformed response: {}", e.without_url()),
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> WalletResult<T> {
        let response = self
            .client
            .get(self.url(path, query))
            .send()
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.status_error(response));
        }
        self.decode(response)
    }
}

fn per_byte(fee_per_kb: u64) -> u64 {
    fee_per_kb.div_ceil(1000).max(1)
}

impl ChainProvider for BlockCypherProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_balance(&self, address: &str) -> WalletResult<u64> {
        let body: BalanceResponse = self.get_json(&format!("/addrs/{}/balance", address), &[])?;
        Ok(body.final_balance.max(0) as u64)
    }

    fn get_utxos(&self, address: &str) -> WalletResult<Vec<ProviderUtxo>> {
        let body: AddressResponse = self.get_json(
            &format!("/addrs/{}", address),
            &[
                ("unspentOnly", "true".to_string()),
                ("includeScript", "true".to_string()),
            ],
        )?;

        let utxos = body
            .txrefs
            .into_iter()
            .chain(body.unconfirmed_txrefs)
            .filter(|r| r.tx_output_n >= 0)
            .map(|r| ProviderUtxo {
                txid: r.tx_hash,
                vout: r.tx_output_n as u32,
                amount: r.value,
                script: r.script.unwrap_or_default(),
                confirmations: r.confirmations,
            })
            .collect();
        Ok(utxos)
    }

    fn get_transaction(&self, txid: &str) -> WalletResult<Option<TxStatus>> {
        let response = self
            .client
            .get(self.url(&format!("/txs/{}", txid), &[]))
            .send()
            .map_err(|e| self.transport_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.status_error(response));
        }

        let body: TxResponse = self.decode(response)?;
        Ok(Some(TxStatus {
            txid: body.hash,
            confirmations: body.confirmations,
            block_height: u64::try_from(body.block_height).ok(),
        }))
    }

    fn get_transactions(&self, address: &str, limit: usize) -> WalletResult<Vec<TxSummary>> {
        let body: AddressResponse = self.get_json(
            &format!("/addrs/{}", address),
            &[("limit", limit.to_string())],
        )?;

        // One txref per input or output touching the address; fold them per tx
        let mut order: Vec<String> = Vec::new();
        let mut folded: BTreeMap<String, TxSummary> = BTreeMap::new();
        for r in body.unconfirmed_txrefs.into_iter().chain(body.txrefs) {
            let delta = if r.tx_input_n >= 0 {
                -(r.value as i64)
            } else {
                r.value as i64
            };
            let entry = folded.entry(r.tx_hash.clone()).or_insert_with(|| {
                order.push(r.tx_hash.clone());
                TxSummary {
                    txid: r.tx_hash.clone(),
                    confirmations: r.confirmations,
                    net_amount: 0,
                }
            });
            entry.net_amount += delta;
        }

        Ok(order
            .into_iter()
            .filter_map(|txid| folded.remove(&txid))
            .take(limit)
            .collect())
    }

    fn broadcast_tx(&self, raw_hex: &str) -> WalletResult<String> {
        let response = self
            .client
            .post(self.url("/txs/push", &[]))
            .json(&json!({ "tx": raw_hex }))
            .send()
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let err = self.status_error(response);
            log_network(
                LogLevel::Warn,
                "broadcast rejected",
                Some(json!({"provider": self.name, "error": err.to_string()})),
            );
            return Err(err);
        }

        let body: PushResponse = self.decode(response)?;
        Ok(body.tx.hash)
    }

    fn get_network_info(&self) -> WalletResult<NetworkInfo> {
        let body: ChainResponse = self.get_json("", &[])?;
        Ok(NetworkInfo {
            height: body.height,
            fees: FeeRates {
                low: per_byte(body.low_fee_per_kb),
                medium: per_byte(body.medium_fee_per_kb),
                high: per_byte(body.high_fee_per_kb),
            },
        })
    }
}
