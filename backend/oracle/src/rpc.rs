//! Ethereum JSON-RPC access: head polling, `eth_getLogs`, nonces and the
//! oracle contract calls.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the node is unreachable, rate-limits
//!   us, or reports `limit exceeded`, up to [`MAX_BACKOFF_SECS`] seconds and
//!   [`MAX_ATTEMPTS`] tries.
//! * Any other JSON-RPC error is returned to the caller; the scheduler retries
//!   the whole task on its next cycle.

use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::types::{Log, H160, H256, U256, U64};
use ethers::utils::id;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{OracleError, Result};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_ATTEMPTS: u32 = 4;

/// JSON-RPC code some providers use for rate limiting.
const LIMIT_EXCEEDED: i64 = -32005;

/// Read access to the ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn block_number(&self) -> Result<i64>;

    /// Logs in `[from_block, to_block]` whose first topic is `topic`.
    async fn logs(&self, from_block: i64, to_block: i64, topic: H256) -> Result<Vec<Log>>;

    async fn transaction_count(&self, address: &str) -> Result<U256>;
}

/// Transactions sent to the randomness / loot-box contract. Every call
/// returns the submitted transaction hash.
#[async_trait]
pub trait OracleContract: Send + Sync {
    /// Account the transactions are sent from.
    fn sender(&self) -> &str;

    async fn commit(&self, digests: &[H256]) -> Result<String>;

    async fn reveal(&self, secret: H256) -> Result<String>;

    async fn open_box(&self, campaign_id: i64, owner: &str, number_of_box: i64) -> Result<String>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

// ─────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
}

impl RpcClient {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 1;

        loop {
            let response = self
                .client
                .post(&self.url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            let retry_reason = match response {
                Err(e) if attempt < MAX_ATTEMPTS => format!("request failed: {e}"),
                Err(e) => return Err(e.into()),
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    "rate-limited".to_string()
                }
                Ok(resp) => {
                    let body: RpcResponse<T> = resp.json().await?;
                    match (body.result, body.error) {
                        (_, Some(err)) if err.code == LIMIT_EXCEEDED && attempt < MAX_ATTEMPTS => {
                            format!("soft error {} {}", err.code, err.message)
                        }
                        (_, Some(err)) => {
                            return Err(OracleError::Rpc {
                                code: err.code,
                                message: err.message,
                            })
                        }
                        (Some(result), None) => return Ok(result),
                        (None, None) => {
                            return Err(OracleError::Decode(format!("Empty result from {method}")))
                        }
                    }
                }
            };

            if attempt >= MAX_ATTEMPTS {
                return Err(OracleError::Rpc {
                    code: LIMIT_EXCEEDED,
                    message: format!("{method}: {retry_reason}"),
                });
            }
            warn!("{method} {retry_reason} (will retry in {backoff}s)");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            attempt += 1;
        }
    }

    async fn send_transaction(&self, from: &str, to: &str, data: Vec<u8>) -> Result<String> {
        let hash: H256 = self
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": from,
                    "to": to,
                    "data": format!("0x{}", hex::encode(data)),
                }]),
            )
            .await?;
        Ok(format!("{hash:?}"))
    }
}

#[async_trait]
impl Ledger for RpcClient {
    async fn block_number(&self) -> Result<i64> {
        let head: U64 = self.call("eth_blockNumber", json!([])).await?;
        Ok(head.as_u64() as i64)
    }

    async fn logs(&self, from_block: i64, to_block: i64, topic: H256) -> Result<Vec<Log>> {
        let logs: Vec<Log> = self
            .call("eth_getLogs", log_filter(from_block, to_block, topic))
            .await?;
        debug!("Fetched {} logs in [{from_block}, {to_block}]", logs.len());
        Ok(logs)
    }

    async fn transaction_count(&self, address: &str) -> Result<U256> {
        self.call("eth_getTransactionCount", json!([address, "latest"]))
            .await
    }
}

fn log_filter(from_block: i64, to_block: i64, topic: H256) -> Value {
    json!([{
        "fromBlock": format!("{from_block:#x}"),
        "toBlock": format!("{to_block:#x}"),
        "topics": [topic],
    }])
}

// ─────────────────────────────────────────────────────────
// Oracle contract
// ─────────────────────────────────────────────────────────

/// Oracle contract driven through a node-managed (unlocked) sender account.
#[derive(Debug, Clone)]
pub struct OracleClient {
    rpc: RpcClient,
    sender: String,
    contract: String,
}

impl OracleClient {
    pub fn new(rpc: RpcClient, sender: String, contract: String) -> Self {
        Self {
            rpc,
            sender,
            contract,
        }
    }
}

#[async_trait]
impl OracleContract for OracleClient {
    fn sender(&self) -> &str {
        &self.sender
    }

    async fn commit(&self, digests: &[H256]) -> Result<String> {
        self.rpc
            .send_transaction(&self.sender, &self.contract, commit_calldata(digests))
            .await
    }

    async fn reveal(&self, secret: H256) -> Result<String> {
        self.rpc
            .send_transaction(&self.sender, &self.contract, reveal_calldata(secret))
            .await
    }

    async fn open_box(&self, campaign_id: i64, owner: &str, number_of_box: i64) -> Result<String> {
        let data = open_box_calldata(campaign_id, owner, number_of_box)?;
        self.rpc
            .send_transaction(&self.sender, &self.contract, data)
            .await
    }
}

fn calldata(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(tokens));
    data
}

fn commit_calldata(digests: &[H256]) -> Vec<u8> {
    let digests = digests
        .iter()
        .map(|d| Token::FixedBytes(d.as_bytes().to_vec()))
        .collect();
    calldata("commit(bytes32[])", &[Token::Array(digests)])
}

fn reveal_calldata(secret: H256) -> Vec<u8> {
    calldata("reveal(bytes32)", &[Token::FixedBytes(secret.as_bytes().to_vec())])
}

fn open_box_calldata(campaign_id: i64, owner: &str, number_of_box: i64) -> Result<Vec<u8>> {
    let owner: H160 = owner
        .parse()
        .map_err(|_| OracleError::Decode(format!("invalid owner address {owner}")))?;
    if campaign_id < 0 || number_of_box <= 0 {
        return Err(OracleError::Integrity(format!(
            "cannot open {number_of_box} boxes of campaign {campaign_id}"
        )));
    }
    Ok(calldata(
        "openBox(uint256,address,uint256)",
        &[
            Token::Uint(U256::from(campaign_id)),
            Token::Address(owner),
            Token::Uint(U256::from(number_of_box)),
        ],
    ))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
