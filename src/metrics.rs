//! Prometheus instrumentation.
//!
//! Advisory pipeline counters: progress, RPC health, commit latency and
//! reorg activity. Correctness never depends on these; the checkpoint is
//! the only authoritative progress record.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Instant;

/// Standard latency buckets (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Blocks committed to the ledger.
    pub static ref BLOCKS_PROCESSED: IntCounter = IntCounter::new(
        "ledgerscan_blocks_processed_total",
        "Blocks committed to the ledger"
    ).unwrap();

    pub static ref TRANSACTIONS_PROCESSED: IntCounter = IntCounter::new(
        "ledgerscan_transactions_processed_total",
        "Transactions replayed through the ledger"
    ).unwrap();

    pub static ref UTXOS_ADDED: IntCounter = IntCounter::new(
        "ledgerscan_utxos_added_total",
        "UTXO entries created"
    ).unwrap();

    pub static ref UTXOS_SPENT: IntCounter = IntCounter::new(
        "ledgerscan_utxos_spent_total",
        "UTXO entries consumed"
    ).unwrap();

    /// RPC call latency, labeled by method.
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("ledgerscan_rpc_call_duration_seconds", "RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    /// RPC failures, labeled by method and classification.
    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("ledgerscan_rpc_errors_total", "RPC failures by classification"),
        &["method", "kind"]
    ).unwrap();

    /// Atomic commit (WriteBatch) latency.
    pub static ref COMMIT_FLUSH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("ledgerscan_commit_flush_duration_seconds", "Atomic block commit latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref REORG_EVENTS: IntCounter = IntCounter::new(
        "ledgerscan_reorg_events_total",
        "Chain reorganizations handled"
    ).unwrap();

    /// Depth of the most recent reorg rollback.
    pub static ref REORG_DEPTH_BLOCKS: IntGauge = IntGauge::new(
        "ledgerscan_reorg_depth_blocks",
        "Blocks rolled back by the most recent reorg"
    ).unwrap();

    /// Heights by source: "node" (RPC tip) and "checkpoint".
    pub static ref CHAIN_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ledgerscan_chain_height", "Chain height by source"),
        &["source"]
    ).unwrap();

    pub static ref SCAN_FAILURES: IntCounter = IntCounter::new(
        "ledgerscan_scan_failures_total",
        "Transient pipeline failures (retried)"
    ).unwrap();
}

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(UTXOS_ADDED.clone()))?;
    REGISTRY.register(Box::new(UTXOS_SPENT.clone()))?;
    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;
    REGISTRY.register(Box::new(COMMIT_FLUSH_DURATION.clone()))?;
    REGISTRY.register(Box::new(REORG_EVENTS.clone()))?;
    REGISTRY.register(Box::new(REORG_DEPTH_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(CHAIN_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(SCAN_FAILURES.clone()))?;
    Ok(())
}

/// Gather the registry in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
