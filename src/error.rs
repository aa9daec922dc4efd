//! Error taxonomy for the scanner pipeline.
//!
//! Recoverable conditions (transient RPC failures, reorgs) are handled
//! inside the scanner loop and never escape it. Fatal conditions stop the
//! pipeline and carry the exact height/hash where processing halted.

use thiserror::Error;

/// RPC failure, classified so the caller can branch explicitly instead of
/// relying on unwinding.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Network/timeout/node-busy. Already retried with backoff by the
    /// client; `attempts` is how many tries were burned.
    #[error("transient RPC failure ({method}) after {attempts} attempt(s): {detail}")]
    Transient {
        method: String,
        attempts: u32,
        detail: String,
    },
    /// Misconfiguration: bad credentials, unknown method, malformed
    /// response schema. Not retry-worthy.
    #[error("fatal RPC failure ({method}): {detail}")]
    Fatal { method: String, detail: String },
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transient { .. })
    }
}

/// Ledger store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Backend(#[from] rocksdb::Error),

    #[error("column family not found: {0}")]
    MissingCf(&'static str),

    #[error("corrupt {what} record: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error("store was initialized for network {stored}, configured network is {configured}")]
    NetworkMismatch { stored: String, configured: String },

    /// Committed state disagrees with the invariants the commit relies on
    /// (spending a non-existent entry, broken checkpoint linkage, negative
    /// balance). Fatal, never retried.
    #[error("ledger inconsistency at height {height}: {detail}")]
    Inconsistent { height: i64, detail: String },
}

/// Top-level pipeline error.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Node-supplied data is inconsistent with previously committed blocks.
    #[error("consistency violation at height {height} (block {hash}, tx {txid}): {detail}")]
    ConsistencyViolation {
        height: i64,
        hash: String,
        txid: String,
        detail: String,
    },

    /// The atomic commit kept failing past the bounded retry count.
    #[error("commit failed at height {height} after {attempts} attempt(s): {detail}")]
    CommitFailed {
        height: i64,
        attempts: u32,
        detail: String,
    },

    /// No common ancestor found within the configured rollback window.
    /// Treated exactly like a consistency violation: fatal, not retried.
    #[error("reorg exceeds maximum rollback depth {max}: no common ancestor at or above height {height}")]
    ReorgDepthExceeded { height: i64, max: u32 },
}

impl ScanError {
    /// Whether the scanner loop may pause and retry later instead of
    /// stopping the pipeline.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::Rpc(e) if e.is_transient())
    }
}
