//! Bitcoin Core JSON-RPC client.
//!
//! The coordinator and watchdog only see the [`NodeClient`] trait, so tests
//! can script a node in memory. [`RpcClient`] is the real implementation: a
//! blocking JSON-RPC 1.0 client over HTTP with basic auth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use gbt_miner_core::hash::{hash_from_display_hex, ParseHashError};
use gbt_miner_core::{BlockTemplate, GetBlockTemplateResponse, Network, TemplateError};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::tracing::prelude::*;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node rejected the RPC credentials")]
    Unauthorized,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{method} failed ({code}): {message}")]
    Node {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("{0} returned no result")]
    EmptyResult(&'static str),

    #[error("invalid block template: {0}")]
    Template(#[from] TemplateError),

    #[error("invalid block hash: {0}")]
    Hash(#[from] ParseHashError),
}

/// Outcome of `submitblock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    /// The node's reason string, such as `duplicate` or `high-hash`.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub difficulty: f64,
}

impl BlockchainInfo {
    pub fn network(&self) -> Option<Network> {
        Network::from_chain_name(&self.chain)
    }
}

/// What the miner needs from a node.
pub trait NodeClient: Send + Sync {
    fn get_block_template(&self) -> Result<BlockTemplate, RpcError>;

    /// Tip hash in internal byte order.
    fn get_best_block_hash(&self) -> Result<[u8; 32], RpcError>;

    fn submit_block(&self, block: &[u8]) -> Result<SubmitResult, RpcError>;

    fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError>;
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

pub struct RpcClient {
    http: Client,
    url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Credentials are sent only when `user` is non-empty.
    pub fn new(url: &str, user: &str, password: &str, timeout: Duration) -> Result<Self, RpcError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(RpcClient {
            http,
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one call and return its `result`, which may be `null`.
    pub fn call(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        trace!(method, id, "RPC call");

        let mut request = self.http.post(&self.url).json(&body);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }
        let response = request.send()?;

        // Bitcoin Core reports RPC errors as HTTP 500 with a JSON body
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RpcError::Unauthorized);
        }
        let text = response.text()?;

        let parsed: Response = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(RpcError::Http {
                    status: status.as_u16(),
                    body: text,
                })
            }
        };

        if let Some(error) = parsed.error {
            return Err(RpcError::Node {
                method,
                code: error.code,
                message: error.message,
            });
        }

        Ok(parsed.result)
    }

    fn call_typed<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, RpcError> {
        match self.call(method, params)? {
            Value::Null => Err(RpcError::EmptyResult(method)),
            result => Ok(serde_json::from_value(result)?),
        }
    }
}

impl NodeClient for RpcClient {
    fn get_block_template(&self) -> Result<BlockTemplate, RpcError> {
        let response: GetBlockTemplateResponse =
            self.call_typed("getblocktemplate", json!([{ "rules": ["segwit"] }]))?;
        Ok(BlockTemplate::try_from(response)?)
    }

    fn get_best_block_hash(&self) -> Result<[u8; 32], RpcError> {
        let hash: String = self.call_typed("getbestblockhash", json!([]))?;
        Ok(hash_from_display_hex(&hash)?)
    }

    fn submit_block(&self, block: &[u8]) -> Result<SubmitResult, RpcError> {
        match self.call("submitblock", json!([hex::encode(block)]))? {
            Value::Null => Ok(SubmitResult::Accepted),
            Value::String(reason) => Ok(SubmitResult::Rejected(reason)),
            other => Ok(SubmitResult::Rejected(other.to_string())),
        }
    }

    fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call_typed("getblockchaininfo", json!([]))
    }
}
