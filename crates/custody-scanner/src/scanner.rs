//! Per-chain block scanner.
//!
//! Advances the block cursor one block at a time. A block is fetched, decoded
//! by every handler, classified and folded into the reconciler; only then are
//! its hash and the cursor persisted, so a scan interrupted anywhere resumes
//! from the last completed block. Re-scans are absorbed by record dedup.
//!
//! Before each pass the last scanned block hash is compared with the chain.
//! A mismatch walks back through the stored hashes to the fork point and
//! hands the rollback to the reconciler.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use custody_chain::{ChainError, ChainHandlers, DynChainAdapter};
use custody_core::{BlockNumber, ChainKey, IncomingRecord, TrackedOrder, TxResult};
use custody_reconciler::{OrderReconciler, RollbackReport};
use custody_store::LedgerStore;
use custody_telemetry::Metrics;

use crate::classifier::Classifier;
use crate::error::{ScanError, ScanResult};
use crate::halt::ScanHalt;

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum blocks folded per pass.
    pub batch_size: u64,
    /// First block scanned when no cursor exists.
    pub start_height: BlockNumber,
    /// Retries of one block on transient errors before the pass gives up.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            start_height: 1,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl ScannerConfig {
    /// `base * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Summary of one scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub tip: BlockNumber,
    /// Blocks folded in this pass.
    pub scanned: Vec<BlockNumber>,
    /// Orders created or updated.
    pub orders: Vec<TrackedOrder>,
    pub rollback: Option<RollbackReport>,
    /// Pass stopped on the shutdown token.
    pub cancelled: bool,
}

impl ScanReport {
    pub fn last_scanned(&self) -> Option<BlockNumber> {
        self.scanned.last().copied()
    }
}

// ============================================================================
// Scanner
// ============================================================================

pub struct Scanner {
    chain: ChainKey,
    handlers: Arc<ChainHandlers>,
    reconciler: Arc<OrderReconciler>,
    classifier: Classifier,
    config: ScannerConfig,
    halt: Arc<ScanHalt>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("chain", &self.chain)
            .field("config", &self.config)
            .field("halted", &self.halt.is_triggered())
            .finish()
    }
}

impl Scanner {
    pub fn new(reconciler: Arc<OrderReconciler>, config: ScannerConfig) -> Self {
        let chain = reconciler.chain().clone();
        let classifier = Classifier::new(chain.clone(), reconciler.registry().clone());
        Self {
            chain,
            handlers: reconciler.handlers().clone(),
            reconciler,
            classifier,
            config,
            halt: Arc::new(ScanHalt::new()),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn halt(&self) -> &Arc<ScanHalt> {
        &self.halt
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    fn store(&self) -> &Arc<dyn LedgerStore> {
        self.reconciler.store()
    }

    fn adapter(&self) -> DynChainAdapter {
        self.handlers.default_handler()
    }

    /// Next block to fold.
    pub fn next_height(&self) -> BlockNumber {
        self.store()
            .cursor()
            .map_or(self.config.start_height, |c| c + 1)
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// Fold up to `batch_size` blocks towards the chain tip.
    pub async fn scan_pass(&self) -> ScanResult<ScanReport> {
        if let Some(reason) = self.halt.reason() {
            return Err(ScanError::Halted(reason));
        }
        let adapter = self.adapter();
        adapter.ensure_connected().await?;
        let tip = self
            .with_retry("get_block_number", || async {
                adapter.get_block_number().await.map_err(ScanError::from)
            })
            .await?;
        Metrics::chain_tip(self.chain.as_str(), tip);

        let mut report = ScanReport {
            tip,
            ..ScanReport::default()
        };

        if let Some(rollback) = self.check_reorg(&adapter, tip).await? {
            let unrecoverable = rollback.unrecoverable;
            let depth = rollback.depth;
            let height = rollback.height;
            report.rollback = Some(rollback);
            if unrecoverable {
                self.halt.trigger(format!(
                    "reorg of depth {depth} at block {height} exceeds the rollback window"
                ));
                return Ok(report);
            }
        }

        let start = self.next_height();
        if start > tip {
            return Ok(report);
        }
        let end = tip.min(start.saturating_add(self.config.batch_size.max(1) - 1));
        for bn in start..=end {
            if self.shutdown.is_cancelled() {
                info!(chain = %self.chain, bn, "Shutdown requested, stopping between blocks");
                report.cancelled = true;
                break;
            }
            let orders = self
                .with_retry("scan_block", || self.scan_block(&adapter, bn))
                .await?;
            report.scanned.push(bn);
            report.orders.extend(orders);
        }
        if let Some(last) = report.last_scanned() {
            debug!(
                chain = %self.chain,
                from = start,
                to = last,
                tip,
                orders = report.orders.len(),
                "Scan pass complete"
            );
        }
        Ok(report)
    }

    /// Run `op`, retrying transient failures with capped exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> ScanResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ScanResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    Metrics::scan_error(self.chain.as_str(), true);
                    let delay = self.config.backoff_delay(attempt);
                    warn!(
                        chain = %self.chain,
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chain request failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.shutdown.cancelled() => return Err(e),
                    }
                }
                Err(e) => {
                    Metrics::scan_error(self.chain.as_str(), e.is_transient());
                    return Err(e);
                }
            }
        }
    }

    /// Fold one block and advance the cursor to it.
    pub async fn scan_block(
        &self,
        adapter: &DynChainAdapter,
        bn: BlockNumber,
    ) -> ScanResult<Vec<TrackedOrder>> {
        let block = adapter.get_block_result(bn).await?;
        let orders = self.scan_txs(&block.txns, Some(bn), false).await?;

        let store = self.store();
        store.put_block_hash(bn, block.hash);
        store.set_cursor(bn);
        let window = self.reconciler.policy().max_reorg_depth;
        store.prune_block_hashes(bn.saturating_sub(window));

        Metrics::block_scanned(self.chain.as_str());
        Metrics::scan_height(self.chain.as_str(), bn);
        Ok(orders)
    }

    /// Decode, classify and fold `txns` observed at `bn` (the cursor when
    /// absent). Does not move the cursor.
    pub async fn scan_txs(
        &self,
        txns: &[TxResult],
        bn: Option<BlockNumber>,
        has_scan_task: bool,
    ) -> ScanResult<Vec<TrackedOrder>> {
        if txns.is_empty() {
            return Ok(Vec::new());
        }
        let bn = bn.unwrap_or_else(|| self.reconciler.current_bn());
        let records = self.decode(txns, bn, has_scan_task).await?;
        let records = self
            .classifier
            .classify_all(&self.adapter(), records)
            .await;
        Ok(self.reconciler.apply_records(&records).await?)
    }

    /// Every handler decodes the block; the first to report a record wins.
    async fn decode(
        &self,
        txns: &[TxResult],
        bn: BlockNumber,
        has_scan_task: bool,
    ) -> ScanResult<Vec<IncomingRecord>> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for handler in self.handlers.all_handlers() {
            for record in handler.filter_transactions(txns, bn, has_scan_task).await? {
                if seen.insert(record.key()) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Re-fold every already-scanned block from `from_bn` that carries a
    /// transaction touching `address`. Used after registering an address
    /// whose history predates it.
    pub async fn scan_address(
        &self,
        coin_name: &str,
        address: &str,
        from_bn: BlockNumber,
    ) -> ScanResult<Vec<TrackedOrder>> {
        let Some(cursor) = self.store().cursor() else {
            return Ok(Vec::new());
        };
        let adapter = self.reconciler.adapter(coin_name);
        let history: HashSet<String> = adapter
            .get_transaction_history(address, coin_name, from_bn)
            .await?
            .into_iter()
            .map(|tx| tx.txid)
            .collect();
        if history.is_empty() {
            return Ok(Vec::new());
        }

        let mut orders = Vec::new();
        for bn in from_bn..=cursor {
            if self.shutdown.is_cancelled() {
                break;
            }
            let block = adapter.get_block_result(bn).await?;
            let txns: Vec<TxResult> = block
                .txns
                .into_iter()
                .filter(|tx| history.contains(&tx.txid))
                .collect();
            orders.extend(self.scan_txs(&txns, Some(bn), true).await?);
        }
        info!(
            chain = %self.chain,
            coin = coin_name,
            address,
            from_bn,
            to_bn = cursor,
            orders = orders.len(),
            "Address rescan complete"
        );
        Ok(orders)
    }

    // ------------------------------------------------------------------
    // Reorg detection
    // ------------------------------------------------------------------

    async fn chain_hash(
        &self,
        adapter: &DynChainAdapter,
        bn: BlockNumber,
        tip: BlockNumber,
    ) -> ScanResult<Option<String>> {
        if bn > tip {
            return Ok(None);
        }
        match adapter.get_block_result(bn).await {
            Ok(block) => Ok(Some(block.hash)),
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Roll back if the last scanned block is no longer on the chain.
    async fn check_reorg(
        &self,
        adapter: &DynChainAdapter,
        tip: BlockNumber,
    ) -> ScanResult<Option<RollbackReport>> {
        let store = self.store();
        let Some(cursor) = store.cursor() else {
            return Ok(None);
        };
        let Some(stored) = store.block_hash(cursor) else {
            return Ok(None);
        };
        if self.chain_hash(adapter, cursor, tip).await?.as_deref() == Some(stored.as_str()) {
            return Ok(None);
        }

        // walk back to the lowest mismatching block
        let mut fork = cursor;
        let mut exhausted = false;
        while fork > self.config.start_height {
            let below = fork - 1;
            let Some(stored) = store.block_hash(below) else {
                // scanned once, hash already pruned: the fork is below the window
                exhausted = true;
                break;
            };
            if self.chain_hash(adapter, below, tip).await?.as_deref() == Some(stored.as_str()) {
                break;
            }
            fork = below;
        }
        let height = if exhausted { fork - 1 } else { fork };

        warn!(chain = %self.chain, height, cursor, tip, "Reorg detected");
        let report = self.reconciler.rollback_from(height, cursor).await?;
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_chain::{SimFailure, SimOp, SimulatedChain};
    use custody_core::{
        Address, AddressRole, ChainIdentity, DisplayAmount, InterventionReason, OrderKind,
        OrderStatus, RecordClass,
    };
    use custody_reconciler::ConfirmationPolicy;
    use custody_registry::AddressRegistry;
    use custody_store::MemoryStore;
    use rust_decimal_macros::dec;

    struct Fixture {
        sim: Arc<SimulatedChain>,
        store: Arc<MemoryStore>,
        reconciler: Arc<OrderReconciler>,
        scanner: Scanner,
    }

    fn fixture(policy: ConfirmationPolicy) -> Fixture {
        let sim = Arc::new(SimulatedChain::new(ChainIdentity {
            key: ChainKey::new("sim"),
            name: "Simulated".to_string(),
            index: 1,
            core_type: "sim".to_string(),
        }));
        let registry = Arc::new(AddressRegistry::new());
        registry
            .register("sim", Address::new(AddressRole::Hot, "main", "hot1"), None, None)
            .unwrap();
        registry
            .register("sim", Address::new(AddressRole::Deposit, "user", "dep1"), None, Some(1))
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(OrderReconciler::new(
            Arc::new(ChainHandlers::new(sim.clone())),
            store.clone(),
            registry,
            policy,
        ));
        let config = ScannerConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 1,
            ..ScannerConfig::default()
        };
        let scanner = Scanner::new(reconciler.clone(), config);
        Fixture {
            sim,
            store,
            reconciler,
            scanner,
        }
    }

    fn amount(v: rust_decimal::Decimal) -> DisplayAmount {
        DisplayAmount::new(v)
    }

    #[tokio::test]
    async fn test_pass_advances_cursor_and_creates_deposit() {
        let f = fixture(ConfirmationPolicy::default());
        f.sim.submit_external("sim", "ext1", "dep1", amount(dec!(2)));
        f.sim.mine();
        f.sim.mine_blocks(2);

        let report = f.scanner.scan_pass().await.unwrap();
        assert_eq!(report.scanned, vec![1, 2, 3]);
        assert_eq!(report.orders.len(), 1);
        assert_eq!(f.store.cursor(), Some(3));
        assert!(f.store.block_hash(3).is_some());

        // nothing new
        let report = f.scanner.scan_pass().await.unwrap();
        assert!(report.scanned.is_empty());
    }

    #[tokio::test]
    async fn test_outflow_to_invalid_address_raises_intervention() {
        let f = fixture(ConfirmationPolicy::default());
        f.sim.submit_external("sim", "hot1", "invalid-drain", amount(dec!(3)));
        f.sim.mine();

        let report = f.scanner.scan_pass().await.unwrap();
        assert_eq!(report.orders.len(), 1);
        let order = &report.orders[0];
        assert_eq!(order.kind, OrderKind::External);
        assert_eq!(order.class, Some(RecordClass::Special));
        assert_eq!(order.order.to, "invalid-drain");
        let interventions = f.store.interventions();
        assert_eq!(interventions.len(), 1);
        assert_eq!(interventions[0].reason, InterventionReason::SpecialRecord);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let f = fixture(ConfirmationPolicy::default());
        f.sim.submit_external("sim", "ext1", "dep1", amount(dec!(2)));
        let bn = f.sim.mine();
        f.scanner.scan_pass().await.unwrap();

        f.store.set_cursor(bn - 1);
        let report = f.scanner.scan_pass().await.unwrap();
        assert_eq!(report.scanned, vec![bn]);
        assert!(report.orders.is_empty());
        assert_eq!(f.store.all_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_without_advancing() {
        let f = fixture(ConfirmationPolicy::default());
        f.sim.mine_blocks(2);
        f.sim.fail_next(SimOp::BlockFetch, SimFailure::Unreachable);
        let report = f.scanner.scan_pass().await.unwrap();
        assert_eq!(report.scanned, vec![1, 2]);

        for _ in 0..=f.scanner.config().max_retries {
            f.sim.fail_next(SimOp::BlockFetch, SimFailure::Unreachable);
        }
        f.sim.mine();
        let err = f.scanner.scan_pass().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.store.cursor(), Some(2));
    }

    #[tokio::test]
    async fn test_reorg_rolls_back_and_rescans() {
        let f = fixture(ConfirmationPolicy::default());
        f.sim.submit_external("sim", "ext1", "dep1", amount(dec!(2)));
        let bn = f.sim.mine();
        f.sim.mine_blocks(3);
        let deposit = f.scanner.scan_pass().await.unwrap().orders[0].id();

        // the deposit is re-included on the new branch
        f.sim.reorg(bn, true);
        f.sim.mine_blocks(5);
        let report = f.scanner.scan_pass().await.unwrap();
        let rollback = report.rollback.unwrap();
        assert_eq!(rollback.height, bn);
        assert_eq!(rollback.rolled_back, vec![deposit]);
        assert_eq!(report.scanned.first(), Some(&bn));

        let order = f.store.order(deposit).unwrap();
        assert_eq!(order.status, OrderStatus::Seen);
        assert_eq!(order.block, Some(bn));
        assert_eq!(f.store.all_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_deep_reorg_halts_scanning() {
        let policy = ConfirmationPolicy {
            max_reorg_depth: 3,
            ..ConfirmationPolicy::default()
        };
        let f = fixture(policy);
        f.sim.mine_blocks(7);
        f.sim.submit_external("sim", "ext1", "dep1", amount(dec!(2)));
        f.sim.mine();
        f.sim.mine_blocks(2);
        f.scanner.scan_pass().await.unwrap();

        f.sim.reorg(1, false);
        f.sim.mine_blocks(10);
        let report = f.scanner.scan_pass().await.unwrap();
        assert!(report.rollback.unwrap().unrecoverable);
        assert!(f.scanner.halt().is_triggered());
        assert!(matches!(
            f.scanner.scan_pass().await.unwrap_err(),
            ScanError::Halted(_)
        ));
        assert_eq!(f.store.cursor(), Some(10));
        assert!(!f.reconciler.interventions().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_pass_stops_between_blocks() {
        let token = CancellationToken::new();
        let f = fixture(ConfirmationPolicy::default());
        let scanner = Scanner::new(f.reconciler.clone(), ScannerConfig::default())
            .with_shutdown(token.clone());
        f.sim.mine_blocks(3);
        token.cancel();
        let report = scanner.scan_pass().await.unwrap();
        assert!(report.cancelled);
        assert!(report.scanned.is_empty());
        assert_eq!(f.store.cursor(), None);
    }

    #[tokio::test]
    async fn test_scan_address_picks_up_late_registration() {
        let f = fixture(ConfirmationPolicy::default());
        f.sim.submit_external("sim", "ext1", "dep9", amount(dec!(4)));
        f.sim.mine();
        f.scanner.scan_pass().await.unwrap();
        assert!(f.store.all_orders().is_empty());

        f.reconciler
            .registry()
            .register("sim", Address::new(AddressRole::Deposit, "user", "dep9"), None, Some(9))
            .unwrap();
        let orders = f.scanner.scan_address("sim", "dep9", 1).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order.to, "dep9");
    }
}
