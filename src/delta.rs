//! Block deltas.
//!
//! Every committed block's effect on the ledger is captured as an explicit,
//! serializable `BlockDelta`: the UTXO entries it created and the entries it
//! consumed (with their full values, so the inverse is self-contained).
//! Forward apply and reorg rollback are the same staging mechanism run over
//! a delta or its inverse; balance changes are derived from the two lists
//! rather than stored, so the two directions cannot drift apart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{OutPoint, UtxoEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDelta {
    pub height: i64,
    pub hash: String,
    pub parent_hash: Option<String>,
    /// Outputs this block added to the UTXO set. Outputs spent within the
    /// same block never appear here.
    pub created: Vec<(OutPoint, UtxoEntry)>,
    /// Previously live entries this block consumed.
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

impl BlockDelta {
    /// The inverse delta: applying it undoes this block.
    pub fn invert(&self) -> BlockDelta {
        BlockDelta {
            height: self.height,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            created: self.spent.clone(),
            spent: self.created.clone(),
        }
    }

    /// Net per-address balance change, derived from the created/spent
    /// lists. Entries without a derivable address carry no balance weight;
    /// zero nets are dropped.
    pub fn balance_changes(&self) -> BTreeMap<String, i64> {
        let mut changes: BTreeMap<String, i64> = BTreeMap::new();
        for (_, entry) in &self.created {
            if let Some(addr) = &entry.address {
                *changes.entry(addr.clone()).or_insert(0) += entry.value as i64;
            }
        }
        for (_, entry) in &self.spent {
            if let Some(addr) = &entry.address {
                *changes.entry(addr.clone()).or_insert(0) -= entry.value as i64;
            }
        }
        changes.retain(|_, v| *v != 0);
        changes
    }
}
