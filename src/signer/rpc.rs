/// Wallet signer reached over Ethereum JSON-RPC.
///
/// Talks to any endpoint that exposes the wallet namespace
/// (`eth_accounts`, `eth_signTypedData_v4`): a browser-wallet bridge, a
/// remote signer, or a dev node with unlocked accounts. The user's approval
/// prompt lives on the other side of the connection.
use std::str::FromStr;

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::StructuredSigner;
use crate::error::{GrantError, Result};
use crate::grant::message::StructuredMessage;

/// EIP-1193 "User Rejected Request".
const USER_REJECTED: i64 = 4001;

/// Configuration for a JSON-RPC wallet.
#[derive(Debug, Clone)]
pub struct RpcSignerConfig {
    /// JSON-RPC endpoint (e.g., "http://localhost:8545").
    pub rpc_url: String,
    /// Account to sign with. When unset, the first of `eth_accounts` is used.
    pub account: Option<Address>,
}

pub struct RpcWalletSigner {
    config: RpcSignerConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

fn classify_rpc_error(err: JsonRpcError) -> GrantError {
    if err.code == USER_REJECTED {
        GrantError::SignatureDeclined(err.message)
    } else {
        GrantError::SignerFailed(format!("RPC error {}: {}", err.code, err.message))
    }
}

/// `eth_signTypedData_v4` params: the account and the typed data as a JSON string.
fn sign_params(account: &Address, message: &StructuredMessage) -> serde_json::Value {
    serde_json::json!([
        format!("{account:#x}"),
        message.to_typed_data_json().to_string()
    ])
}

impl RpcWalletSigner {
    pub fn new(config: RpcSignerConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    async fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp: JsonRpcResponse<T> = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GrantError::SignerFailed(format!("RPC transport error: {e}")))?
            .json()
            .await
            .map_err(|e| GrantError::SignerFailed(format!("RPC response parse error: {e}")))?;

        if let Some(err) = resp.error {
            return Err(classify_rpc_error(err));
        }

        resp.result
            .ok_or_else(|| GrantError::SignerFailed("Empty RPC response".into()))
    }
}

#[async_trait]
impl StructuredSigner for RpcWalletSigner {
    async fn address(&self) -> Result<Address> {
        if let Some(account) = self.config.account {
            return Ok(account);
        }
        let accounts: Vec<String> = self.rpc_call("eth_accounts", serde_json::json!([])).await?;
        let first = accounts
            .first()
            .ok_or_else(|| GrantError::SignerFailed("Wallet exposes no accounts".into()))?;
        Address::from_str(first)
            .map_err(|e| GrantError::SignerFailed(format!("Invalid account {first}: {e}")))
    }

    async fn sign_structured_message(&self, message: &StructuredMessage) -> Result<Bytes> {
        message.validate()?;
        let account = self.address().await?;
        debug!(account = %account, "Requesting eth_signTypedData_v4");

        let sig_hex: String = self
            .rpc_call("eth_signTypedData_v4", sign_params(&account, message))
            .await?;
        Bytes::from_str(&sig_hex)
            .map_err(|e| GrantError::SignerFailed(format!("Invalid signature encoding: {e}")))
    }
}
