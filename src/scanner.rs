//! Scanner: the pipeline orchestrator.
//!
//! One logical task owns the Fetching → Decoding → Committing sequence.
//! Fetching runs a bounded number of blocks ahead concurrently, but blocks
//! are decoded and committed strictly in height order: balances never
//! reflect block N+1 before block N, and no two blocks commit concurrently.
//!
//! Recoverable conditions stay inside the loop: transient RPC exhaustion
//! pauses and retries without advancing the checkpoint, reorgs roll back to
//! the common ancestor and resume forward. Fatal conditions (bad
//! credentials, consistency violations, exhausted commit retries) stop the
//! pipeline carrying the exact checkpoint where processing halted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::address::derive_address;
use crate::config::ScannerSettings;
use crate::delta::BlockDelta;
use crate::error::{ScanError, StoreError};
use crate::metrics;
use crate::reorg;
use crate::rpc::BlockSource;
use crate::store::{Applied, LedgerStore};
use crate::telemetry::truncate_hex;
use crate::types::{Block, Network, OutPoint, RunStats, UtxoEntry};

pub struct Scanner<S: BlockSource> {
    source: Arc<S>,
    store: Arc<LedgerStore>,
    network: Network,
    settings: ScannerSettings,
    shutdown: watch::Receiver<bool>,
    stats: RunStats,
    last_progress: Instant,
}

impl<S: BlockSource + 'static> Scanner<S> {
    pub fn new(
        source: Arc<S>,
        store: Arc<LedgerStore>,
        network: Network,
        settings: ScannerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            store,
            network,
            settings,
            shutdown,
            stats: RunStats::default(),
            last_progress: Instant::now(),
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Run until a shutdown signal or a fatal error. Keeps following the
    /// chain tip after catching up.
    pub async fn run(mut self) -> Result<RunStats, ScanError> {
        match self.store.checkpoint()? {
            Some(cp) => info!(
                height = cp.height,
                hash = %truncate_hex(&cp.hash, 16),
                "Resuming from checkpoint"
            ),
            None => info!(
                start_height = self.settings.start_height,
                "No checkpoint found, starting fresh scan"
            ),
        }

        loop {
            if self.shutdown_requested() {
                break;
            }
            match self.sync_to_tip().await {
                Ok(()) => {
                    // Caught up; wait for the node to extend the chain.
                    self.wait(self.settings.poll_interval()).await;
                }
                Err(e) if e.is_transient() => {
                    self.stats.failures += 1;
                    metrics::SCAN_FAILURES.inc();
                    warn!(
                        error = %e,
                        pause_secs = self.settings.retry_pause_secs,
                        "Transient failure, pausing before retry"
                    );
                    self.wait(self.settings.retry_pause()).await;
                }
                Err(fatal) => {
                    match self.store.checkpoint().ok().flatten() {
                        Some(cp) => error!(
                            error = %fatal,
                            height = cp.height,
                            hash = %truncate_hex(&cp.hash, 16),
                            "Fatal error, pipeline halted at checkpoint"
                        ),
                        None => error!(error = %fatal, "Fatal error before first commit"),
                    }
                    return Err(fatal);
                }
            }
        }

        let final_height = self
            .store
            .checkpoint()?
            .map(|cp| cp.height)
            .unwrap_or(self.settings.start_height - 1);
        info!(
            blocks_processed = self.stats.blocks_processed,
            failures = self.stats.failures,
            height = final_height,
            "Scanner stopped"
        );
        Ok(self.stats)
    }

    /// Catch up with the node's current tip once. Returns when the
    /// checkpoint reaches the tip, a shutdown is requested, or an error
    /// needs the caller's attention.
    pub async fn sync_to_tip(&mut self) -> Result<(), ScanError> {
        loop {
            if self.shutdown_requested() {
                return Ok(());
            }
            let tip = self.source.chain_height().await?;
            metrics::CHAIN_HEIGHT.with_label_values(&["node"]).set(tip);

            let next = match self.store.checkpoint()? {
                Some(cp) => cp.height + 1,
                None => self.settings.start_height,
            };
            if next > tip {
                return Ok(());
            }

            // Prefetch a bounded run concurrently; ordering is restored by
            // the sequential loop below.
            let end = tip.min(next + self.settings.prefetch_depth.max(1) as i64 - 1);
            let fetches: Vec<_> = (next..=end)
                .map(|height| self.source.block_at_height(height))
                .collect();
            let blocks = futures::future::try_join_all(fetches).await?;

            for block in blocks {
                if self.shutdown_requested() {
                    return Ok(());
                }
                match self.store.checkpoint()? {
                    Some(cp) => {
                        if block.height != cp.height + 1 {
                            // Stale prefetch (checkpoint moved under us,
                            // e.g. a rollback); refetch from the top.
                            break;
                        }
                        if block.prev_hash.as_deref() != Some(cp.hash.as_str()) {
                            let outcome = reorg::handle_reorg(
                                self.source.as_ref(),
                                &self.store,
                                self.settings.max_rollback_depth,
                            )
                            .await?;
                            self.stats.reorgs += 1;
                            debug!(
                                rolled_back = outcome.rolled_back,
                                "Discarding prefetched blocks after rollback"
                            );
                            break;
                        }
                    }
                    None => {
                        if block.height != self.settings.start_height {
                            break;
                        }
                    }
                }

                let delta = self.build_delta(&block)?;
                self.commit_with_retry(&delta).await?;
                self.note_block(&block, tip);
            }
        }
    }

    /// Decode one block into its ledger delta. Inputs resolve against the
    /// in-flight block first (intra-block spends never reach the store),
    /// then against the committed UTXO set.
    fn build_delta(&self, block: &Block) -> Result<BlockDelta, ScanError> {
        let mut pending: Vec<Option<(OutPoint, UtxoEntry)>> = Vec::new();
        let mut pending_idx: HashMap<OutPoint, usize> = HashMap::new();
        let mut spent: Vec<(OutPoint, UtxoEntry)> = Vec::new();

        for tx in &block.txs {
            for input in &tx.inputs {
                let Some(prevout) = &input.prevout else {
                    // Coinbase input, nothing to consume.
                    continue;
                };
                if let Some(pos) = pending_idx.remove(prevout) {
                    pending[pos] = None;
                    continue;
                }
                let entry =
                    self.store
                        .utxo(prevout)?
                        .ok_or_else(|| ScanError::ConsistencyViolation {
                            height: block.height,
                            hash: block.hash.clone(),
                            txid: tx.txid.clone(),
                            detail: format!("input references unknown output {}", prevout),
                        })?;
                spent.push((prevout.clone(), entry));
            }
            for output in &tx.outputs {
                let outpoint = OutPoint::new(tx.txid.clone(), output.n);
                let entry = UtxoEntry {
                    address: derive_address(&output.script, self.network),
                    value: output.value,
                    height: block.height,
                };
                match pending_idx.get(&outpoint) {
                    // Duplicate txid within a block: the later output wins,
                    // plain value arithmetic either way.
                    Some(&pos) => pending[pos] = Some((outpoint, entry)),
                    None => {
                        pending_idx.insert(outpoint.clone(), pending.len());
                        pending.push(Some((outpoint, entry)));
                    }
                }
            }
        }

        Ok(BlockDelta {
            height: block.height,
            hash: block.hash.clone(),
            parent_hash: block.prev_hash.clone(),
            created: pending.into_iter().flatten().collect(),
            spent,
        })
    }

    /// Commit the delta atomically, retrying bounded on store trouble.
    /// Consistency errors are never retried. A retry that finds the
    /// checkpoint already advanced (crash between write and observation)
    /// is a no-op.
    async fn commit_with_retry(&mut self, delta: &BlockDelta) -> Result<(), ScanError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let store = Arc::clone(&self.store);
            let staged = delta.clone();
            let result = task::spawn_blocking(move || store.apply_block(&staged))
                .await
                .map_err(|e| ScanError::CommitFailed {
                    height: delta.height,
                    attempts,
                    detail: format!("commit task failed: {}", e),
                })?;

            match result {
                Ok(Applied::Committed) => {
                    metrics::UTXOS_ADDED.inc_by(delta.created.len() as u64);
                    metrics::UTXOS_SPENT.inc_by(delta.spent.len() as u64);
                    debug!(
                        height = delta.height,
                        hash = %truncate_hex(&delta.hash, 16),
                        created = delta.created.len(),
                        spent = delta.spent.len(),
                        "Block committed"
                    );
                    return Ok(());
                }
                Ok(Applied::AlreadyCommitted) => {
                    warn!(
                        height = delta.height,
                        "Checkpoint already covers block, skipping re-application"
                    );
                    return Ok(());
                }
                Err(e @ StoreError::Inconsistent { .. })
                | Err(e @ StoreError::NetworkMismatch { .. }) => {
                    return Err(ScanError::Store(e));
                }
                Err(e) => {
                    if attempts > self.settings.commit_retries {
                        return Err(ScanError::CommitFailed {
                            height: delta.height,
                            attempts,
                            detail: e.to_string(),
                        });
                    }
                    self.stats.failures += 1;
                    warn!(
                        height = delta.height,
                        attempt = attempts,
                        error = %e,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(200 * attempts as u64)).await;
                }
            }
        }
    }

    fn note_block(&mut self, block: &Block, tip: i64) {
        self.stats.blocks_processed += 1;
        self.stats.last_rpc_latency_ms = self.source.last_latency_ms();
        metrics::BLOCKS_PROCESSED.inc();
        metrics::TRANSACTIONS_PROCESSED.inc_by(block.txs.len() as u64);
        metrics::CHAIN_HEIGHT
            .with_label_values(&["checkpoint"])
            .set(block.height);

        if self.last_progress.elapsed() >= self.settings.progress_interval() {
            self.last_progress = Instant::now();
            info!(
                height = block.height,
                behind = tip - block.height,
                blocks_processed = self.stats.blocks_processed,
                failures = self.stats.failures,
                last_rpc_latency_ms = self.stats.last_rpc_latency_ms,
                "Scan progress"
            );
            if let Err(e) = self.store.save_run_stats(&self.stats) {
                debug!(error = %e, "Failed to persist run stats");
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep, waking early on shutdown.
    async fn wait(&mut self, duration: Duration) {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::store::LedgerStore;
    use crate::types::{Transaction, TxInput, TxOutput};
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory chain the scanner can be pointed at; supports swapping
    /// the tail to simulate a reorg and injecting transient failures.
    struct FakeChain {
        blocks: Mutex<Vec<Block>>,
        fail_next: AtomicU32,
    }

    impl FakeChain {
        fn new(blocks: Vec<Block>) -> Self {
            Self {
                blocks: Mutex::new(blocks),
                fail_next: AtomicU32::new(0),
            }
        }

        fn replace_from(&self, height: i64, tail: Vec<Block>) {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.truncate(height as usize);
            blocks.extend(tail);
        }

        fn fail_next(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        fn take_failure(&self) -> bool {
            self.fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl BlockSource for FakeChain {
        async fn chain_height(&self) -> Result<i64, RpcError> {
            if self.take_failure() {
                return Err(RpcError::Transient {
                    method: "getblockcount".into(),
                    attempts: 3,
                    detail: "injected".into(),
                });
            }
            Ok(self.blocks.lock().unwrap().len() as i64 - 1)
        }

        async fn block_hash(&self, height: i64) -> Result<String, RpcError> {
            let blocks = self.blocks.lock().unwrap();
            blocks
                .get(height as usize)
                .map(|b| b.hash.clone())
                .ok_or_else(|| RpcError::Fatal {
                    method: "getblockhash".into(),
                    detail: format!("height {} out of range", height),
                })
        }

        async fn block_at_height(&self, height: i64) -> Result<Block, RpcError> {
            if self.take_failure() {
                return Err(RpcError::Transient {
                    method: "getblock".into(),
                    attempts: 3,
                    detail: "injected".into(),
                });
            }
            let blocks = self.blocks.lock().unwrap();
            blocks
                .get(height as usize)
                .cloned()
                .ok_or_else(|| RpcError::Fatal {
                    method: "getblock".into(),
                    detail: format!("height {} out of range", height),
                })
        }
    }

    fn txid(n: u64) -> String {
        format!("{:064x}", n)
    }

    fn block_hash(branch: u64, height: i64) -> String {
        format!("{:032x}{:032x}", branch, height as u64)
    }

    fn p2pkh_script(b: u8) -> Vec<u8> {
        let mut s = vec![0x76, 0xa9, 0x14];
        s.extend_from_slice(&[b; 20]);
        s.extend_from_slice(&[0x88, 0xac]);
        s
    }

    fn p2wpkh_script(b: u8) -> Vec<u8> {
        let mut s = vec![0x00, 0x14];
        s.extend_from_slice(&[b; 20]);
        s
    }

    fn multisig_script() -> Vec<u8> {
        let mut s = vec![0x51, 0x21];
        s.extend_from_slice(&[0x02; 33]);
        s.extend_from_slice(&[0x51, 0xae]);
        s
    }

    fn addr(script: &[u8]) -> String {
        derive_address(script, Network::Testnet).unwrap()
    }

    fn coinbase_tx(id: u64, outputs: &[(&[u8], u64)]) -> Transaction {
        Transaction {
            txid: txid(id),
            inputs: vec![TxInput { prevout: None }],
            outputs: outs(outputs),
        }
    }

    fn spend_tx(id: u64, spends: &[OutPoint], outputs: &[(&[u8], u64)]) -> Transaction {
        Transaction {
            txid: txid(id),
            inputs: spends
                .iter()
                .map(|op| TxInput {
                    prevout: Some(op.clone()),
                })
                .collect(),
            outputs: outs(outputs),
        }
    }

    fn outs(outputs: &[(&[u8], u64)]) -> Vec<TxOutput> {
        outputs
            .iter()
            .enumerate()
            .map(|(n, (script, value))| TxOutput {
                n: n as u32,
                value: *value,
                script: script.to_vec(),
            })
            .collect()
    }

    fn block(branch: u64, height: i64, parent: Option<String>, txs: Vec<Transaction>) -> Block {
        Block {
            hash: block_hash(branch, height),
            height,
            prev_hash: parent,
            txs,
        }
    }

    fn scanner_for(
        chain: Arc<FakeChain>,
        dir: &TempDir,
        settings: ScannerSettings,
    ) -> (Scanner<FakeChain>, Arc<LedgerStore>) {
        let store = Arc::new(
            LedgerStore::open(dir.path(), Network::Testnet, settings.max_rollback_depth).unwrap(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Keep the sender alive for the test's lifetime; no test requests
        // shutdown.
        std::mem::forget(shutdown_tx);
        let scanner = Scanner::new(
            chain,
            Arc::clone(&store),
            Network::Testnet,
            settings,
            shutdown_rx,
        );
        (scanner, store)
    }

    fn assert_balances_match_utxos(store: &LedgerStore) {
        let mut expected: Map<String, u64> = Map::new();
        for (_, entry) in store.utxos().unwrap() {
            if let Some(a) = entry.address {
                *expected.entry(a).or_insert(0) += entry.value;
            }
        }
        let actual: Map<String, u64> = store.balances(0).unwrap().into_iter().collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn coinbase_and_spend_scenario() {
        // Height 0 records a 10-unit output; height 1 has a coinbase
        // paying 50 to a P2WPKH script and a transaction spending the
        // 10-unit output into 7 + 3 across two P2PKH addresses.
        let script_c = p2pkh_script(0xcc);
        let script_w = p2wpkh_script(0x11);
        let script_a = p2pkh_script(0xaa);
        let script_b = p2pkh_script(0xbb);

        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&script_c, 10)])]);
        let b1 = block(
            0,
            1,
            Some(b0.hash.clone()),
            vec![
                coinbase_tx(2, &[(&script_w, 50)]),
                spend_tx(
                    3,
                    &[OutPoint::new(txid(1), 0)],
                    &[(&script_a, 7), (&script_b, 3)],
                ),
            ],
        );

        let chain = Arc::new(FakeChain::new(vec![b0, b1]));
        let dir = TempDir::new().unwrap();
        let (mut scanner, store) = scanner_for(chain, &dir, ScannerSettings::default());

        scanner.sync_to_tip().await.unwrap();

        assert_eq!(store.balance(&addr(&script_w)).unwrap(), 50);
        assert_eq!(store.balance(&addr(&script_a)).unwrap(), 7);
        assert_eq!(store.balance(&addr(&script_b)).unwrap(), 3);
        assert_eq!(store.balance(&addr(&script_c)).unwrap(), 0);

        // Spent entry is gone, the two new entries exist.
        assert!(store.utxo(&OutPoint::new(txid(1), 0)).unwrap().is_none());
        assert!(store.utxo(&OutPoint::new(txid(3), 0)).unwrap().is_some());
        assert!(store.utxo(&OutPoint::new(txid(3), 1)).unwrap().is_some());

        assert_eq!(store.checkpoint().unwrap().unwrap().height, 1);
        assert_eq!(scanner.stats().blocks_processed, 2);
        assert_balances_match_utxos(&store);
    }

    #[tokio::test]
    async fn undecodable_output_has_null_address() {
        let ms = multisig_script();
        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&ms, 42)])]);
        let chain = Arc::new(FakeChain::new(vec![b0]));
        let dir = TempDir::new().unwrap();
        let (mut scanner, store) = scanner_for(chain, &dir, ScannerSettings::default());

        scanner.sync_to_tip().await.unwrap();

        let entry = store.utxo(&OutPoint::new(txid(1), 0)).unwrap().unwrap();
        assert_eq!(entry.address, None);
        assert_eq!(entry.value, 42);
        // No balance row anywhere.
        assert!(store.balances(0).unwrap().is_empty());
        assert_balances_match_utxos(&store);
    }

    #[tokio::test]
    async fn intra_block_spend_never_reaches_store() {
        let script_x = p2pkh_script(0x01);
        let script_y = p2pkh_script(0x02);
        let script_z = p2pkh_script(0x03);

        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&script_x, 10)])]);
        // tx 2 spends the height-0 output; tx 3 spends tx 2's output
        // within the same block.
        let b1 = block(
            0,
            1,
            Some(b0.hash.clone()),
            vec![
                spend_tx(2, &[OutPoint::new(txid(1), 0)], &[(&script_y, 10)]),
                spend_tx(3, &[OutPoint::new(txid(2), 0)], &[(&script_z, 10)]),
            ],
        );

        let chain = Arc::new(FakeChain::new(vec![b0, b1]));
        let dir = TempDir::new().unwrap();
        let (mut scanner, store) = scanner_for(chain, &dir, ScannerSettings::default());

        scanner.sync_to_tip().await.unwrap();

        // The transient output never hit the store.
        assert!(store.utxo(&OutPoint::new(txid(2), 0)).unwrap().is_none());
        assert!(store.utxo(&OutPoint::new(txid(3), 0)).unwrap().is_some());
        assert_eq!(store.balance(&addr(&script_y)).unwrap(), 0);
        assert_eq!(store.balance(&addr(&script_z)).unwrap(), 10);
        assert_balances_match_utxos(&store);
    }

    #[tokio::test]
    async fn zero_value_outputs_are_processed() {
        let script = p2pkh_script(0x05);
        let b0 = block(
            0,
            0,
            None,
            vec![coinbase_tx(1, &[(&script, 0), (&script, 5)])],
        );
        let chain = Arc::new(FakeChain::new(vec![b0]));
        let dir = TempDir::new().unwrap();
        let (mut scanner, store) = scanner_for(chain, &dir, ScannerSettings::default());

        scanner.sync_to_tip().await.unwrap();

        assert_eq!(store.balance(&addr(&script)).unwrap(), 5);
        assert!(store.utxo(&OutPoint::new(txid(1), 0)).unwrap().is_some());
        assert_balances_match_utxos(&store);
    }

    #[tokio::test]
    async fn three_block_fork_reorg() {
        let script_common = p2pkh_script(0x10);
        let script_a = p2pkh_script(0xa0);
        let script_b = p2pkh_script(0xb0);

        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&script_common, 25)])]);
        // Losing branch: heights 1-2.
        let a1 = block(
            0xa,
            1,
            Some(b0.hash.clone()),
            vec![coinbase_tx(10, &[(&script_a, 11)])],
        );
        let a2 = block(
            0xa,
            2,
            Some(a1.hash.clone()),
            vec![coinbase_tx(11, &[(&script_a, 12)])],
        );

        let chain = Arc::new(FakeChain::new(vec![b0.clone(), a1, a2]));
        let dir = TempDir::new().unwrap();
        let (mut scanner, store) = scanner_for(Arc::clone(&chain), &dir, ScannerSettings::default());

        scanner.sync_to_tip().await.unwrap();
        assert_eq!(store.balance(&addr(&script_a)).unwrap(), 23);
        assert_eq!(store.checkpoint().unwrap().unwrap().height, 2);

        // The node switches to a longer branch forking at height 0.
        let n1 = block(
            0xb,
            1,
            Some(b0.hash.clone()),
            vec![coinbase_tx(20, &[(&script_b, 5)])],
        );
        let n2 = block(
            0xb,
            2,
            Some(n1.hash.clone()),
            vec![coinbase_tx(21, &[(&script_b, 6)])],
        );
        let n3 = block(
            0xb,
            3,
            Some(n2.hash.clone()),
            vec![coinbase_tx(22, &[(&script_b, 7)])],
        );
        chain.replace_from(1, vec![n1, n2, n3.clone()]);

        scanner.sync_to_tip().await.unwrap();

        // Only the winning branch's transactions remain.
        assert_eq!(store.balance(&addr(&script_a)).unwrap(), 0);
        assert_eq!(store.balance(&addr(&script_b)).unwrap(), 18);
        assert_eq!(store.balance(&addr(&script_common)).unwrap(), 25);
        let cp = store.checkpoint().unwrap().unwrap();
        assert_eq!(cp.height, 3);
        assert_eq!(cp.hash, n3.hash);
        assert_eq!(scanner.stats().reorgs, 1);
        assert_balances_match_utxos(&store);
    }

    #[tokio::test]
    async fn transient_failure_does_not_advance_checkpoint() {
        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&p2pkh_script(1), 5)])]);
        let chain = Arc::new(FakeChain::new(vec![b0]));
        chain.fail_next(10);
        let dir = TempDir::new().unwrap();
        let (mut scanner, store) = scanner_for(Arc::clone(&chain), &dir, ScannerSettings::default());

        let err = scanner.sync_to_tip().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.checkpoint().unwrap(), None);

        // Once the node recovers, the same scanner catches up.
        chain.fail_next(0);
        scanner.sync_to_tip().await.unwrap();
        assert_eq!(store.checkpoint().unwrap().unwrap().height, 0);
    }

    #[tokio::test]
    async fn reorg_deeper_than_bound_is_fatal() {
        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&p2pkh_script(1), 5)])]);
        let a1 = block(0xa, 1, Some(b0.hash.clone()), vec![coinbase_tx(2, &[])]);
        let a2 = block(0xa, 2, Some(a1.hash.clone()), vec![coinbase_tx(3, &[])]);

        let chain = Arc::new(FakeChain::new(vec![b0.clone(), a1, a2]));
        let dir = TempDir::new().unwrap();
        let settings = ScannerSettings {
            max_rollback_depth: 1,
            ..ScannerSettings::default()
        };
        let (mut scanner, store) = scanner_for(Arc::clone(&chain), &dir, settings);
        scanner.sync_to_tip().await.unwrap();

        let n1 = block(0xb, 1, Some(b0.hash.clone()), vec![coinbase_tx(4, &[])]);
        let n2 = block(0xb, 2, Some(n1.hash.clone()), vec![coinbase_tx(5, &[])]);
        let n3 = block(0xb, 3, Some(n2.hash.clone()), vec![coinbase_tx(6, &[])]);
        chain.replace_from(1, vec![n1, n2, n3]);

        let err = scanner.sync_to_tip().await.unwrap_err();
        assert!(matches!(err, ScanError::ReorgDepthExceeded { max: 1, .. }));
        // The partial rollback left a consistent ledger.
        assert!(store.checkpoint().unwrap().is_some());
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_without_reprocessing() {
        let script = p2pkh_script(0x42);
        let b0 = block(0, 0, None, vec![coinbase_tx(1, &[(&script, 5)])]);
        let b1 = block(
            0,
            1,
            Some(b0.hash.clone()),
            vec![coinbase_tx(2, &[(&script, 6)])],
        );

        let chain = Arc::new(FakeChain::new(vec![b0.clone(), b1.clone()]));
        let dir = TempDir::new().unwrap();
        {
            let (mut scanner, store) =
                scanner_for(Arc::clone(&chain), &dir, ScannerSettings::default());
            scanner.sync_to_tip().await.unwrap();
            assert_eq!(store.balance(&addr(&script)).unwrap(), 11);
            drop(store);
        }

        // New scanner over the same store; the chain has grown by one.
        let b2 = block(
            0,
            2,
            Some(b1.hash.clone()),
            vec![coinbase_tx(3, &[(&script, 7)])],
        );
        chain.replace_from(2, vec![b2]);
        let (mut scanner, store) = scanner_for(chain, &dir, ScannerSettings::default());
        scanner.sync_to_tip().await.unwrap();

        assert_eq!(store.balance(&addr(&script)).unwrap(), 18);
        // Only the new block was processed this run.
        assert_eq!(scanner.stats().blocks_processed, 1);
    }
}
