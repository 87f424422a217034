//! Ethereum JSON-RPC client for the pledge ledger contract, plus the HTTP
//! fetch of the contract state snapshot.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the node returns an error or
//!   rate-limit response, up to [`MAX_BACKOFF_SECS`] seconds.
//! * Transient network errors (connection reset, timeout, 5xx) are retried
//!   until they succeed; JSON-RPC codes -32600 / -32601 abort the run.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::amount::Amount;
use crate::chain::ChainSnapshot;
use crate::errors::{ReconcileError, Result};
use crate::events::{ChainEvent, TransferValues};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

/// keccak256("Transfer(uint256,uint256,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xaf6151f5085accf2d57e1e7bf7601d3b3982e0de7e9a90f032f8554de9c104f6";
/// keccak256("CancelProject(uint256)")
pub const CANCEL_PROJECT_TOPIC: &str =
    "0x74acb192d39829b88a66ad5363afa9120c5a306a458287a870351ae34a04d346";

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    timestamp: String,
}

/// What one attempt produced: a value, or a reason to try again.
enum Attempt<T> {
    Done(T),
    Retry(String),
}

/// Retry delays: doubling from `initial`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }
}

/// How a JSON-RPC error object is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcFailure {
    Retry,
    Abort,
}

// ─────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    rpc_url: String,
    backoff: Backoff,
}

impl RpcClient {
    pub fn new(client: Client, rpc_url: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            backoff: Backoff::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry_delays(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Latest block number known to the node.
    pub async fn block_number(&self) -> Result<u64> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&v)
    }

    /// Timestamp (unix seconds) of a block.
    pub async fn block_timestamp(&self, block: u64) -> Result<i64> {
        let v = self
            .call("eth_getBlockByNumber", json!([format!("{block:#x}"), false]))
            .await?;
        if v.is_null() {
            return Err(ReconcileError::MissingTimestamp(block));
        }
        let raw: RawBlock = serde_json::from_value(v)?;
        let ts = parse_quantity(&Value::String(raw.timestamp))?;
        i64::try_from(ts).map_err(|_| ReconcileError::EventParse(format!("timestamp {ts}")))
    }

    /// Transfer and CancelProject logs of `address` in `[from_block, to_block]`.
    pub async fn get_logs(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        let v = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": address,
                    "fromBlock": format!("{from_block:#x}"),
                    "toBlock": format!("{to_block:#x}"),
                    "topics": [[TRANSFER_TOPIC, CANCEL_PROJECT_TOPIC]],
                }]),
            )
            .await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Issue one JSON-RPC call, retrying transient failures with back-off.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        with_backoff(method, self.backoff, || self.attempt_call(&body)).await
    }

    /// Fetch the pledge/admin snapshot from the state service. A snapshot
    /// with no pledges or admins is treated as a failed fetch and retried.
    pub async fn fetch_state(&self, state_url: &str) -> Result<ChainSnapshot> {
        with_backoff("state snapshot", self.backoff, || self.attempt_state(state_url)).await
    }

    async fn attempt_call(&self, body: &Value) -> Result<Attempt<Value>> {
        let resp = match self.client.post(&self.rpc_url).json(body).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(Attempt::Retry(format!("request failed: {e}"))),
        };
        if let Some(reason) = transient_status(resp.status()) {
            return Ok(Attempt::Retry(reason));
        }

        let body: RpcResponse = resp.json().await?;
        if let Some(err) = body.error {
            return match classify_rpc_error(err.code) {
                RpcFailure::Abort => Err(ReconcileError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
                RpcFailure::Retry => Ok(Attempt::Retry(format!(
                    "soft error {} {}",
                    err.code, err.message
                ))),
            };
        }
        Ok(Attempt::Done(body.result.unwrap_or(Value::Null)))
    }

    async fn attempt_state(&self, state_url: &str) -> Result<Attempt<ChainSnapshot>> {
        let resp = match self.client.get(state_url).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(Attempt::Retry(format!("request failed: {e}"))),
        };
        if let Some(reason) = transient_status(resp.status()) {
            return Ok(Attempt::Retry(reason));
        }
        let snapshot: ChainSnapshot = resp.json().await?;
        if !snapshot.is_populated() {
            debug!(
                "pledges: {}, admins: {}",
                snapshot.pledges.len(),
                snapshot.admins.len()
            );
            return Ok(Attempt::Retry("snapshot has no pledges or admins".to_string()));
        }
        Ok(Attempt::Done(snapshot))
    }
}

async fn with_backoff<T, F, Fut>(what: &str, backoff: Backoff, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Attempt<T>>>,
{
    let mut delay = backoff.initial;
    loop {
        match attempt().await? {
            Attempt::Done(v) => return Ok(v),
            Attempt::Retry(reason) => {
                warn!("Problem fetching {what} (will retry in {delay:?}): {reason}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(backoff.max);
            }
        }
    }
}

/// Code -32600 / -32601 are hard failures; everything else we retry.
fn classify_rpc_error(code: i64) -> RpcFailure {
    match code {
        -32600 | -32601 => RpcFailure::Abort,
        _ => RpcFailure::Retry,
    }
}

fn transient_status(status: StatusCode) -> Option<String> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some("rate-limited".to_string())
    } else if status.is_server_error() {
        Some(format!("server returned {status}"))
    } else {
        None
    }
}

// ─────────────────────────────────────────────────────────
// Log decoding
// ─────────────────────────────────────────────────────────

/// Decode raw logs into cacheable events. Removed (re-orged) logs and logs
/// with other topics are dropped; malformed ones are an error.
pub fn decode_logs(raw: &[RawLog]) -> Result<Vec<ChainEvent>> {
    let mut out = Vec::with_capacity(raw.len());
    for log in raw.iter().filter(|l| !l.removed) {
        if let Some(ev) = decode_single(log)? {
            out.push(ev);
        }
    }
    Ok(out)
}

fn decode_single(log: &RawLog) -> Result<Option<ChainEvent>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let meta = (
        log.transaction_hash.as_str(),
        parse_quantity(&Value::String(log.log_index.clone()))?,
        parse_quantity(&Value::String(log.block_number.clone()))?,
        None,
    );

    match topic0.to_lowercase().as_str() {
        TRANSFER_TOPIC => {
            let values = TransferValues {
                from: topic_id(log, 1)?,
                to: topic_id(log, 2)?,
                amount: word(&log.data, 0)?,
            };
            Ok(Some(ChainEvent::transfer(meta, &values)))
        }
        CANCEL_PROJECT_TOPIC => Ok(Some(ChainEvent::cancel_project(meta, topic_id(log, 1)?))),
        _ => Ok(None),
    }
}

fn topic_id(log: &RawLog, i: usize) -> Result<u64> {
    let topic = log.topics.get(i).ok_or_else(|| {
        ReconcileError::EventParse(format!("{} missing topic {i}", log.transaction_hash))
    })?;
    word(topic, 0)?
        .to_u64()
        .ok_or_else(|| ReconcileError::EventParse(format!("topic {topic} is not an id")))
}

/// The `n`th 32-byte word of a hex blob.
fn word(hex_blob: &str, n: usize) -> Result<Amount> {
    let bytes = hex::decode(hex_blob.trim_start_matches("0x"))
        .map_err(|e| ReconcileError::EventParse(format!("bad hex {hex_blob}: {e}")))?;
    bytes
        .get(n * 32..(n + 1) * 32)
        .map(Amount::from_be_bytes)
        .ok_or_else(|| ReconcileError::EventParse(format!("word {n} missing in {hex_blob}")))
}

/// Parse a `0x`-prefixed JSON-RPC quantity.
fn parse_quantity(v: &Value) -> Result<u64> {
    v.as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| ReconcileError::EventParse(format!("bad quantity {v}")))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
