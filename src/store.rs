//! Ledger store.
//!
//! Persistent consolidated state over RocksDB column families:
//!
//! - `utxos`       txid(32) + vout_le(4) → bincode `UtxoEntry`
//! - `balances`    address bytes → u64 LE (zero balances are deleted)
//! - `chain_state` checkpoint, network marker, advisory run stats
//! - `undo`        height_le(8) → bincode `BlockDelta`, pruned beyond the
//!                 rollback window
//!
//! A block's whole effect (UTXO removals and additions, balance updates,
//! undo record, checkpoint advance) commits as ONE RocksDB `WriteBatch`:
//! either everything lands or nothing does. A crash mid-commit leaves the
//! pre-block state, which is what makes checkpoint-based resume correct
//! without extra recovery logic. Rollback stages the inverted delta through
//! the same path.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamily, Options, WriteBatch, DB};
use tracing::{debug, info};

use crate::delta::BlockDelta;
use crate::error::StoreError;
use crate::metrics;
use crate::types::{Checkpoint, Network, OutPoint, RunStats, UtxoEntry};

pub const CF_UTXOS: &str = "utxos";
pub const CF_BALANCES: &str = "balances";
pub const CF_CHAIN_STATE: &str = "chain_state";
pub const CF_UNDO: &str = "undo";

const KEY_CHECKPOINT: &[u8] = b"checkpoint";
const KEY_NETWORK: &[u8] = b"network";
const KEY_RUN_STATS: &[u8] = b"run_stats";

/// Outcome of an apply: committed now, or skipped because the checkpoint
/// already covers the height (crash-retry idempotence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Committed,
    AlreadyCommitted,
}

pub struct LedgerStore {
    db: Arc<DB>,
    /// How many trailing undo records are retained; bounds rollback depth.
    undo_window: u32,
}

fn height_key(height: i64) -> [u8; 8] {
    height.to_le_bytes()
}

impl LedgerStore {
    /// Open (or create) the store at `path`. Refuses to open a store that
    /// was initialized for a different network.
    pub fn open(path: &Path, network: Network, undo_window: u32) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_names = vec![CF_UTXOS, CF_BALANCES, CF_CHAIN_STATE, CF_UNDO];
        let db = DB::open_cf(&opts, path, cf_names)?;
        let store = Self {
            db: Arc::new(db),
            undo_window,
        };

        let cf_state = store.cf(CF_CHAIN_STATE)?;
        match store.db.get_cf(cf_state, KEY_NETWORK)? {
            Some(stored) => {
                let stored = String::from_utf8_lossy(&stored).to_string();
                if stored != network.as_str() {
                    return Err(StoreError::NetworkMismatch {
                        stored,
                        configured: network.to_string(),
                    });
                }
            }
            None => {
                store
                    .db
                    .put_cf(cf_state, KEY_NETWORK, network.as_str().as_bytes())?;
                info!(network = %network, path = %path.display(), "Initialized empty ledger store");
            }
        }

        Ok(store)
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or(StoreError::MissingCf(name))
    }

    /// Last committed block, or `None` for an empty ledger.
    pub fn checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf(CF_CHAIN_STATE)?;
        match self.db.get_cf(cf, KEY_CHECKPOINT)? {
            Some(bytes) => {
                let cp = bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt {
                    what: "checkpoint",
                    detail: e.to_string(),
                })?;
                Ok(Some(cp))
            }
            None => Ok(None),
        }
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let cf = self.cf(CF_UTXOS)?;
        match self.db.get_cf(cf, outpoint.storage_key())? {
            Some(bytes) => {
                let entry = bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt {
                    what: "utxo",
                    detail: e.to_string(),
                })?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn balance(&self, address: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_BALANCES)?;
        match self.db.get_cf(cf, address.as_bytes())? {
            Some(bytes) => decode_balance(&bytes),
            None => Ok(0),
        }
    }

    /// All addresses with balance >= `min`, for the consolidated dump.
    pub fn balances(&self, min: u64) -> Result<Vec<(String, u64)>, StoreError> {
        let cf = self.cf(CF_BALANCES)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let balance = decode_balance(&value)?;
            if balance >= min {
                out.push((String::from_utf8_lossy(&key).to_string(), balance));
            }
        }
        Ok(out)
    }

    /// Every live UTXO entry. Rollback itself reads undo records instead,
    /// but this is the full-set read the invariant checks rely on.
    pub fn utxos(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, StoreError> {
        let cf = self.cf(CF_UTXOS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() != 36 {
                return Err(StoreError::Corrupt {
                    what: "utxo",
                    detail: format!("key length {} (expected 36)", key.len()),
                });
            }
            let vout = u32::from_le_bytes([key[32], key[33], key[34], key[35]]);
            let outpoint = OutPoint::new(hex::encode(&key[..32]), vout);
            let entry = bincode::deserialize(&value).map_err(|e| StoreError::Corrupt {
                what: "utxo",
                detail: e.to_string(),
            })?;
            out.push((outpoint, entry));
        }
        Ok(out)
    }

    /// Undo record for a committed height, if still inside the window.
    pub fn undo_delta(&self, height: i64) -> Result<Option<BlockDelta>, StoreError> {
        let cf = self.cf(CF_UNDO)?;
        match self.db.get_cf(cf, height_key(height))? {
            Some(bytes) => {
                let delta = bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt {
                    what: "undo",
                    detail: e.to_string(),
                })?;
                Ok(Some(delta))
            }
            None => Ok(None),
        }
    }

    /// Apply one block's delta plus the checkpoint advance as a single
    /// atomic commit.
    ///
    /// Preconditions enforced here, before any write is staged:
    /// - height already covered by the checkpoint → skip (idempotent retry)
    /// - otherwise the delta must extend the checkpoint by exactly one
    ///   height with a matching parent hash
    /// - every spent entry must exist in the store and agree with the delta
    /// - no balance may go negative
    pub fn apply_block(&self, delta: &BlockDelta) -> Result<Applied, StoreError> {
        match self.checkpoint()? {
            Some(cp) if delta.height <= cp.height => {
                debug!(
                    height = delta.height,
                    checkpoint = cp.height,
                    "Checkpoint already covers height, skipping re-apply"
                );
                return Ok(Applied::AlreadyCommitted);
            }
            Some(cp) => {
                if delta.height != cp.height + 1 {
                    return Err(StoreError::Inconsistent {
                        height: delta.height,
                        detail: format!(
                            "commit does not extend checkpoint at height {}",
                            cp.height
                        ),
                    });
                }
                if delta.parent_hash.as_deref() != Some(cp.hash.as_str()) {
                    return Err(StoreError::Inconsistent {
                        height: delta.height,
                        detail: format!(
                            "parent hash {:?} does not match checkpoint hash {}",
                            delta.parent_hash, cp.hash
                        ),
                    });
                }
            }
            None => {}
        }

        for (outpoint, expected) in &delta.spent {
            let existing = self.utxo(outpoint)?.ok_or_else(|| StoreError::Inconsistent {
                height: delta.height,
                detail: format!("spent output {} not found in ledger", outpoint),
            })?;
            if existing != *expected {
                return Err(StoreError::Inconsistent {
                    height: delta.height,
                    detail: format!("spent output {} disagrees with ledger entry", outpoint),
                });
            }
        }

        let balance_writes = self.compute_balance_writes(delta)?;

        let timer = metrics::Timer::new();
        let mut batch = WriteBatch::default();
        self.stage_delta(&mut batch, delta)?;
        self.stage_balances(&mut batch, &balance_writes)?;

        let cf_undo = self.cf(CF_UNDO)?;
        let encoded = bincode::serialize(delta).map_err(|e| StoreError::Corrupt {
            what: "undo",
            detail: e.to_string(),
        })?;
        batch.put_cf(cf_undo, height_key(delta.height), encoded);
        let pruned = delta.height - self.undo_window as i64;
        if pruned >= 0 {
            batch.delete_cf(cf_undo, height_key(pruned));
        }

        let cf_state = self.cf(CF_CHAIN_STATE)?;
        let checkpoint = Checkpoint {
            height: delta.height,
            hash: delta.hash.clone(),
        };
        let encoded = bincode::serialize(&checkpoint).map_err(|e| StoreError::Corrupt {
            what: "checkpoint",
            detail: e.to_string(),
        })?;
        batch.put_cf(cf_state, KEY_CHECKPOINT, encoded);

        self.db.write(batch)?;
        metrics::COMMIT_FLUSH_DURATION.observe(timer.elapsed_secs());
        Ok(Applied::Committed)
    }

    /// Undo the checkpoint block by staging its inverted delta through the
    /// same mechanism used for forward application. Returns the checkpoint
    /// after rollback (`None` when the ledger is back to empty).
    pub fn rollback_tip(&self) -> Result<Option<Checkpoint>, StoreError> {
        let cp = self.checkpoint()?.ok_or_else(|| StoreError::Inconsistent {
            height: -1,
            detail: "rollback requested on an empty ledger".into(),
        })?;
        let delta = self
            .undo_delta(cp.height)?
            .ok_or_else(|| StoreError::Inconsistent {
                height: cp.height,
                detail: "undo record missing (beyond the retained rollback window)".into(),
            })?;

        let inverse = delta.invert();
        let balance_writes = self.compute_balance_writes(&inverse)?;

        let mut batch = WriteBatch::default();
        self.stage_delta(&mut batch, &inverse)?;
        self.stage_balances(&mut batch, &balance_writes)?;

        let cf_undo = self.cf(CF_UNDO)?;
        batch.delete_cf(cf_undo, height_key(cp.height));

        let cf_state = self.cf(CF_CHAIN_STATE)?;
        let new_checkpoint = delta.parent_hash.as_ref().map(|parent| Checkpoint {
            height: cp.height - 1,
            hash: parent.clone(),
        });
        match &new_checkpoint {
            Some(new_cp) => {
                let encoded = bincode::serialize(new_cp).map_err(|e| StoreError::Corrupt {
                    what: "checkpoint",
                    detail: e.to_string(),
                })?;
                batch.put_cf(cf_state, KEY_CHECKPOINT, encoded);
            }
            None => batch.delete_cf(cf_state, KEY_CHECKPOINT),
        }

        self.db.write(batch)?;
        debug!(height = cp.height, "Rolled back tip block");
        Ok(new_checkpoint)
    }

    /// Best-effort advisory counters; never part of a block commit.
    pub fn save_run_stats(&self, stats: &RunStats) -> Result<(), StoreError> {
        let cf = self.cf(CF_CHAIN_STATE)?;
        let encoded = bincode::serialize(stats).map_err(|e| StoreError::Corrupt {
            what: "run_stats",
            detail: e.to_string(),
        })?;
        self.db.put_cf(cf, KEY_RUN_STATS, encoded)?;
        Ok(())
    }

    pub fn load_run_stats(&self) -> Result<RunStats, StoreError> {
        let cf = self.cf(CF_CHAIN_STATE)?;
        match self.db.get_cf(cf, KEY_RUN_STATS)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt {
                what: "run_stats",
                detail: e.to_string(),
            }),
            None => Ok(RunStats::default()),
        }
    }

    /// Stage the UTXO-set mutations of a delta: delete spent, insert
    /// created. Rollback calls this with the inverted delta.
    fn stage_delta(&self, batch: &mut WriteBatch, delta: &BlockDelta) -> Result<(), StoreError> {
        let cf_utxos = self.cf(CF_UTXOS)?;
        for (outpoint, _) in &delta.spent {
            batch.delete_cf(cf_utxos, outpoint.storage_key());
        }
        for (outpoint, entry) in &delta.created {
            let encoded = bincode::serialize(entry).map_err(|e| StoreError::Corrupt {
                what: "utxo",
                detail: e.to_string(),
            })?;
            batch.put_cf(cf_utxos, outpoint.storage_key(), encoded);
        }
        Ok(())
    }

    /// Resolve a delta's net balance changes against current balances.
    /// `None` means the address row is deleted (balance reached zero).
    fn compute_balance_writes(
        &self,
        delta: &BlockDelta,
    ) -> Result<Vec<(String, Option<u64>)>, StoreError> {
        let mut writes = Vec::new();
        for (address, change) in delta.balance_changes() {
            let current = self.balance(&address)? as i128;
            let next = current + change as i128;
            if next < 0 {
                return Err(StoreError::Inconsistent {
                    height: delta.height,
                    detail: format!(
                        "balance of {} would become negative ({} {:+})",
                        address, current, change
                    ),
                });
            }
            writes.push((
                address,
                if next == 0 { None } else { Some(next as u64) },
            ));
        }
        Ok(writes)
    }

    fn stage_balances(
        &self,
        batch: &mut WriteBatch,
        writes: &[(String, Option<u64>)],
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_BALANCES)?;
        for (address, balance) in writes {
            match balance {
                Some(value) => batch.put_cf(cf, address.as_bytes(), value.to_le_bytes()),
                None => batch.delete_cf(cf, address.as_bytes()),
            }
        }
        Ok(())
    }
}

fn decode_balance(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        what: "balance",
        detail: format!("value length {} (expected 8)", bytes.len()),
    })?;
    Ok(u64::from_le_bytes(arr))
}
