//! Client for the blockchain REST service: balances, unsigned transaction
//! construction and broadcast of signed transactions.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ChainConfig;
use crate::error::{CoordinatorError, Result};

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Serialize)]
pub struct Destination {
    pub destination: String,
    pub amount: String,
}

/// EIP-1559 fee caps, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeParams {
    pub max_fee_per_gas: u64,
    pub max_priority_fee_per_gas: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionRequest {
    pub from: String,
    pub to: Vec<Destination>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<BTreeMap<String, FeeParams>>,
}

#[derive(Debug, Deserialize)]
struct AccountBalance {
    confirmed_balance: String,
}

#[derive(Debug, Deserialize)]
struct UnsignedTransaction {
    unsigned_tx: String,
}

#[derive(Debug, Serialize)]
struct BroadcastRequest<'a> {
    tx: &'a str,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    id: String,
}

pub struct ChainClient {
    http: Client,
    api_base: String,
    protocol: String,
    network: String,
    api_key: String,
}

impl fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainClient")
            .field("api_base", &self.api_base)
            .field("protocol", &self.protocol)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl ChainClient {
    pub fn new(config: &ChainConfig, api_key: impl Into<String>) -> Self {
        ChainClient {
            http: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            protocol: config.protocol.clone(),
            network: config.network.clone(),
            api_key: api_key.into(),
        }
    }

    /// Reads the API key from the environment variable named in `config`.
    pub fn from_env(config: &ChainConfig) -> Result<Self> {
        match std::env::var(&config.api_key_env) {
            Ok(key) if !key.is_empty() => Ok(Self::new(config, key)),
            _ => Err(CoordinatorError::Config(format!(
                "environment variable '{}' must be set",
                config.api_key_env
            ))),
        }
    }

    fn universal_url(&self, suffix: &str) -> String {
        format!(
            "{}/universal/v1/{}/{}/{suffix}",
            self.api_base, self.protocol, self.network
        )
    }

    /// Confirmed balance of `address` in the chain's base unit.
    pub async fn balance(&self, address: &str) -> Result<String> {
        let request = self.http.get(self.universal_url(&format!("account/{address}")));
        let balances: Vec<AccountBalance> = self.send(request).await?;
        balances
            .into_iter()
            .next()
            .map(|b| b.confirmed_balance)
            .ok_or_else(|| CoordinatorError::Chain(format!("no balance reported for {address}")))
    }

    /// Hex-encoded unsigned transfer of `amount` from `from` to `to`.
    pub async fn create_transaction(
        &self,
        from: &str,
        to: &str,
        amount: &str,
        fees: Option<FeeParams>,
    ) -> Result<String> {
        self.create_transaction_with(&self.transfer(from, to, amount, fees))
            .await
    }

    /// Hex-encoded unsigned transaction built by the service.
    pub async fn create_transaction_with(&self, request: &TransactionRequest) -> Result<String> {
        let http_request = self.http.post(self.universal_url("tx/create")).json(request);
        let unsigned: UnsignedTransaction = self.send(http_request).await?;
        tracing::info!(from = %request.from, "unsigned transaction created");
        Ok(unsigned.unsigned_tx)
    }

    /// Builds a single-destination transfer with optional fee caps.
    pub fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: &str,
        fees: Option<FeeParams>,
    ) -> TransactionRequest {
        TransactionRequest {
            from: from.to_string(),
            to: vec![Destination {
                destination: to.to_string(),
                amount: amount.to_string(),
            }],
            protocol: fees.map(|f| BTreeMap::from([(self.protocol.clone(), f)])),
        }
    }

    /// Submits a signed raw transaction; returns the service's transaction id.
    pub async fn broadcast(&self, signed_tx_hex: &str) -> Result<String> {
        let url = format!(
            "{}/tx/v1/{}-{}/send",
            self.api_base, self.protocol, self.network
        );
        let request = self.http.post(url).json(&BroadcastRequest { tx: signed_tx_hex });
        let response: BroadcastResponse = self.send(request).await?;
        tracing::info!(tx_id = %response.id, "transaction broadcast");
        Ok(response.id)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| CoordinatorError::Chain(format!("request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "blockchain service rejected request");
            return Err(CoordinatorError::Chain(format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| CoordinatorError::Chain(format!("unexpected response: {e}")))
    }
}
