//! JSON-RPC client for a Bitcoin-compatible node.
//!
//! Raw `reqwest` POSTs with basic auth rather than a chain-specific client
//! library: `getblock` with verbosity=2 returns mixed shapes that the
//! wrapper crates choke on, and we only need three methods. Transient
//! failures (connection trouble, HTTP 5xx, node warming up) are retried
//! with exponential backoff up to a configured cap; fatal failures (bad
//! credentials, unknown method, malformed schema) propagate immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::RpcSettings;
use crate::error::RpcError;
use crate::metrics;
use crate::types::{Block, OutPoint, Transaction, TxInput, TxOutput};

/// JSON-RPC error code a warming-up node returns until it is ready.
const RPC_IN_WARMUP: i64 = -28;
/// JSON-RPC error code for an unknown method.
const RPC_METHOD_NOT_FOUND: i64 = -32601;

/// Anything the scanner can pull blocks from. The production impl is
/// `RpcClient`; tests drive the scanner with a fixture chain.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current best height reported by the node.
    async fn chain_height(&self) -> Result<i64, RpcError>;

    /// Block hash at a height on the node's current best chain.
    async fn block_hash(&self, height: i64) -> Result<String, RpcError>;

    /// Fully decoded block at a height on the node's current best chain.
    async fn block_at_height(&self, height: i64) -> Result<Block, RpcError>;

    /// Latency of the most recent successful call in milliseconds.
    /// Advisory; fixture sources keep the default.
    fn last_latency_ms(&self) -> u64 {
        0
    }
}

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    max_retries: u32,
    backoff_base_ms: u64,
    last_latency_ms: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(settings: &RpcSettings) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| RpcError::Fatal {
                method: "client".into(),
                detail: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            url: settings.url.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
            max_retries: settings.max_retries,
            backoff_base_ms: settings.backoff_base_ms,
            last_latency_ms: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let timer = metrics::Timer::new();
            match self.call_once(method, params.clone()).await {
                Ok(result) => {
                    let elapsed = timer.elapsed_secs();
                    metrics::RPC_CALL_DURATION
                        .with_label_values(&[method])
                        .observe(elapsed);
                    self.last_latency_ms
                        .store((elapsed * 1000.0) as u64, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(CallFailure { transient, detail }) => {
                    metrics::RPC_ERRORS
                        .with_label_values(&[method, if transient { "transient" } else { "fatal" }])
                        .inc();
                    if !transient {
                        return Err(RpcError::Fatal {
                            method: method.to_string(),
                            detail,
                        });
                    }
                    if attempts > self.max_retries {
                        return Err(RpcError::Transient {
                            method: method.to_string(),
                            attempts,
                            detail,
                        });
                    }
                    let backoff =
                        Duration::from_millis(self.backoff_base_ms << (attempts - 1).min(6));
                    warn!(
                        method,
                        attempt = attempts,
                        max = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %detail,
                        "Transient RPC failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value, CallFailure> {
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "jsonrpc": "1.0",
                "id": "ledgerscan",
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| CallFailure {
                transient: true,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !classify_http_status(status.as_u16()).ok {
            return Err(CallFailure {
                transient: classify_http_status(status.as_u16()).transient,
                detail: format!("HTTP {}", status),
            });
        }

        let envelope: RpcEnvelope = response.json().await.map_err(|e| CallFailure {
            transient: false,
            detail: format!("malformed RPC response: {}", e),
        })?;

        if let Some(error) = envelope.error {
            return Err(CallFailure {
                transient: classify_rpc_code(error.code),
                detail: format!("RPC error {}: {}", error.code, error.message),
            });
        }
        envelope.result.ok_or(CallFailure {
            transient: false,
            detail: "RPC response carried neither result nor error".into(),
        })
    }
}

#[async_trait]
impl BlockSource for RpcClient {
    async fn chain_height(&self) -> Result<i64, RpcError> {
        let result = self.call("getblockcount", json!([])).await?;
        result.as_i64().ok_or_else(|| RpcError::Fatal {
            method: "getblockcount".into(),
            detail: format!("expected integer, got {}", result),
        })
    }

    async fn block_hash(&self, height: i64) -> Result<String, RpcError> {
        let result = self.call("getblockhash", json!([height])).await?;
        result
            .as_str()
            .map(String::from)
            .ok_or_else(|| RpcError::Fatal {
                method: "getblockhash".into(),
                detail: format!("expected string, got {}", result),
            })
    }

    async fn block_at_height(&self, height: i64) -> Result<Block, RpcError> {
        let hash = self.block_hash(height).await?;
        // Verbosity 2 includes full transaction data: scripts, values and
        // previous-output references in one round trip.
        let result = self.call("getblock", json!([hash, 2])).await?;
        let raw: RawBlock = serde_json::from_value(result).map_err(|e| RpcError::Fatal {
            method: "getblock".into(),
            detail: format!("malformed block schema: {}", e),
        })?;
        decode_block(raw)
    }

    fn last_latency_ms(&self) -> u64 {
        self.last_latency_ms.load(Ordering::Relaxed)
    }
}

struct CallFailure {
    transient: bool,
    detail: String,
}

struct StatusClass {
    ok: bool,
    transient: bool,
}

/// 2xx fine; 5xx means a struggling node worth retrying; 401/403 and
/// everything else means misconfiguration.
fn classify_http_status(status: u16) -> StatusClass {
    StatusClass {
        ok: (200..300).contains(&status),
        transient: (500..600).contains(&status),
    }
}

/// Warming-up is the one JSON-RPC error worth waiting out; everything
/// else indicates misconfiguration or node-side rejection.
fn classify_rpc_code(code: i64) -> bool {
    match code {
        RPC_IN_WARMUP => true,
        RPC_METHOD_NOT_FOUND => false,
        _ => false,
    }
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

// Wire shapes for `getblock` verbosity=2.

#[derive(Debug, Deserialize)]
struct RawBlock {
    hash: String,
    height: i64,
    #[serde(default)]
    previousblockhash: Option<String>,
    tx: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    txid: String,
    #[serde(default)]
    vin: Vec<RawVin>,
    #[serde(default)]
    vout: Vec<RawVout>,
}

#[derive(Debug, Deserialize)]
struct RawVin {
    #[serde(default)]
    coinbase: Option<String>,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawVout {
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RawScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RawScriptPubKey {
    #[serde(default)]
    hex: String,
}

fn decode_block(raw: RawBlock) -> Result<Block, RpcError> {
    let schema_err = |detail: String| RpcError::Fatal {
        method: "getblock".into(),
        detail,
    };

    let mut txs = Vec::with_capacity(raw.tx.len());
    for tx in raw.tx {
        if tx.txid.len() != 64 || hex::decode(&tx.txid).is_err() {
            return Err(schema_err(format!("invalid txid {:?}", tx.txid)));
        }
        let mut inputs = Vec::with_capacity(tx.vin.len());
        for vin in tx.vin {
            let prevout = if vin.coinbase.is_some() {
                None
            } else {
                match (vin.txid, vin.vout) {
                    (Some(txid), Some(vout)) => Some(OutPoint::new(txid, vout)),
                    _ => {
                        return Err(schema_err(format!(
                            "input of tx {} has neither coinbase nor prevout",
                            tx.txid
                        )))
                    }
                }
            };
            inputs.push(TxInput { prevout });
        }
        let mut outputs = Vec::with_capacity(tx.vout.len());
        for vout in tx.vout {
            let script = hex::decode(&vout.script_pub_key.hex).map_err(|e| {
                schema_err(format!("invalid script hex in tx {}: {}", tx.txid, e))
            })?;
            outputs.push(TxOutput {
                n: vout.n,
                value: btc_to_sats(vout.value)
                    .ok_or_else(|| schema_err(format!("invalid value in tx {}", tx.txid)))?,
                script,
            });
        }
        txs.push(Transaction {
            txid: tx.txid,
            inputs,
            outputs,
        });
    }

    Ok(Block {
        hash: raw.hash,
        height: raw.height,
        prev_hash: raw.previousblockhash,
        txs,
    })
}

/// Verbose RPC reports values as BTC floats; the ledger works in integer
/// sats. Rounding absorbs the float representation error.
fn btc_to_sats(value: f64) -> Option<u64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * 100_000_000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert!(classify_http_status(200).ok);
        let s = classify_http_status(503);
        assert!(!s.ok && s.transient);
        let s = classify_http_status(401);
        assert!(!s.ok && !s.transient);
        let s = classify_http_status(404);
        assert!(!s.ok && !s.transient);
    }

    #[test]
    fn rpc_code_classification() {
        assert!(classify_rpc_code(RPC_IN_WARMUP));
        assert!(!classify_rpc_code(RPC_METHOD_NOT_FOUND));
        assert!(!classify_rpc_code(-5));
    }

    #[test]
    fn sats_conversion() {
        assert_eq!(btc_to_sats(0.0), Some(0));
        assert_eq!(btc_to_sats(50.0), Some(5_000_000_000));
        // The classic float-representation trap.
        assert_eq!(btc_to_sats(0.1), Some(10_000_000));
        assert_eq!(btc_to_sats(20.99999999), Some(2_099_999_999));
        assert_eq!(btc_to_sats(-1.0), None);
        assert_eq!(btc_to_sats(f64::NAN), None);
    }

    fn raw_block_json() -> Value {
        json!({
            "hash": "00".repeat(32),
            "height": 7,
            "previousblockhash": "01".repeat(32),
            "tx": [
                {
                    "txid": "aa".repeat(32),
                    "vin": [{"coinbase": "0312"}],
                    "vout": [
                        {"value": 50.0, "n": 0,
                         "scriptPubKey": {"hex": "0014751e76e8199196d454941c45d1b3a323f1433bd6"}}
                    ]
                },
                {
                    "txid": "bb".repeat(32),
                    "vin": [{"txid": "cc".repeat(32), "vout": 1}],
                    "vout": [
                        {"value": 0.00000007, "n": 0, "scriptPubKey": {"hex": "6a"}}
                    ]
                }
            ]
        })
    }

    #[test]
    fn decodes_verbose_block() {
        let raw: RawBlock = serde_json::from_value(raw_block_json()).unwrap();
        let block = decode_block(raw).unwrap();

        assert_eq!(block.height, 7);
        assert_eq!(block.prev_hash.as_deref(), Some("01".repeat(32).as_str()));
        assert_eq!(block.txs.len(), 2);
        // Coinbase input carries no prevout.
        assert_eq!(block.txs[0].inputs[0].prevout, None);
        assert_eq!(block.txs[0].outputs[0].value, 5_000_000_000);
        assert_eq!(
            block.txs[1].inputs[0].prevout,
            Some(OutPoint::new("cc".repeat(32), 1))
        );
        assert_eq!(block.txs[1].outputs[0].value, 7);
    }

    #[test]
    fn rejects_malformed_schema() {
        let mut bad = raw_block_json();
        bad["tx"][0]["txid"] = json!("not-a-txid");
        let raw: RawBlock = serde_json::from_value(bad).unwrap();
        assert!(matches!(
            decode_block(raw),
            Err(RpcError::Fatal { .. })
        ));

        let mut bad = raw_block_json();
        bad["tx"][1]["vin"][0] = json!({"sequence": 0});
        let raw: RawBlock = serde_json::from_value(bad).unwrap();
        assert!(matches!(decode_block(raw), Err(RpcError::Fatal { .. })));
    }
}
