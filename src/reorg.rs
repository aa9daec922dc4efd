//! Chain reorganization handling.
//!
//! When a fetched block's parent hash does not match the checkpoint, the
//! local tip has been orphaned. The ledger walks backwards one height at a
//! time — comparing the node's reported hash at the checkpoint height with
//! ours — undoing each block via its stored delta, until the hashes agree
//! (common ancestor) or the configured rollback bound is exceeded.
//! Rollback is the inverse of the same atomic-delta commit used going
//! forward, so a crash mid-reorg leaves a consistent ledger at some
//! intermediate height and the next run simply resumes the walk.

use std::sync::Arc;

use tokio::task;
use tracing::{info, warn};

use crate::error::ScanError;
use crate::metrics;
use crate::rpc::BlockSource;
use crate::store::LedgerStore;
use crate::telemetry::truncate_hex;

/// Summary of a handled reorganization.
#[derive(Debug, Clone)]
pub struct ReorgInfo {
    /// Height of the common ancestor; `None` when the rollback went past
    /// the first scanned block.
    pub fork_height: Option<i64>,
    /// Number of blocks undone.
    pub rolled_back: u32,
    /// Hash of the abandoned tip.
    pub old_tip_hash: String,
}

/// Roll the ledger back to the common ancestor with the node's current
/// chain. Exceeding `max_depth` without finding one is fatal.
pub async fn handle_reorg<S: BlockSource + ?Sized>(
    source: &S,
    store: &Arc<LedgerStore>,
    max_depth: u32,
) -> Result<ReorgInfo, ScanError> {
    let start = store
        .checkpoint()?
        .ok_or_else(|| ScanError::ConsistencyViolation {
            height: -1,
            hash: String::new(),
            txid: String::new(),
            detail: "reorg signaled on an empty ledger".into(),
        })?;

    warn!(
        height = start.height,
        hash = %truncate_hex(&start.hash, 16),
        "Chain reorganization detected, searching for common ancestor"
    );

    let mut rolled_back = 0u32;
    let fork_height = loop {
        let cp = match store.checkpoint()? {
            Some(cp) => cp,
            // Rolled back past the first scanned block; the forward scan
            // restarts from the configured start height.
            None => break None,
        };
        let node_hash = source.block_hash(cp.height).await?;
        if node_hash == cp.hash {
            break Some(cp.height);
        }
        if rolled_back >= max_depth {
            return Err(ScanError::ReorgDepthExceeded {
                height: cp.height,
                max: max_depth,
            });
        }
        let store = Arc::clone(store);
        task::spawn_blocking(move || store.rollback_tip())
            .await
            .map_err(|e| ScanError::CommitFailed {
                height: cp.height,
                attempts: 1,
                detail: format!("rollback task failed: {}", e),
            })??;
        rolled_back += 1;
    };

    metrics::REORG_EVENTS.inc();
    metrics::REORG_DEPTH_BLOCKS.set(rolled_back as i64);
    info!(
        fork_height = fork_height.unwrap_or(-1),
        orphaned_blocks = rolled_back,
        old_tip = %truncate_hex(&start.hash, 16),
        "Rollback complete, resuming forward scan"
    );

    Ok(ReorgInfo {
        fork_height,
        rolled_back,
        old_tip_hash: start.hash,
    })
}
