//! Per-chain round driver.
//!
//! One closer round:
//! 1. `closer_pre_hook` (may rewrite ruler data)
//! 2. scan pass (reorg check, block folding)
//! 3. release satisfied await plans, notify seen orders
//! 4. per coin: `tx_and_sweep_pre_hook`, deposit sweeps, settle, `tx_and_sweep_post_hook`
//! 5. `closer_post_hook` envelope, ruler persisted

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use custody_core::{BlockNumber, ChainKey, OrderId};
use custody_reconciler::{OrderReconciler, RollbackReport, SettleReport};
use custody_scanner::{ScanError, Scanner};
use custody_telemetry::Metrics;

use crate::clock::{Clock, SystemClock};
use crate::error::SchedulerResult;
use crate::hooks::{NoopRoundHooks, RoundEnvelope, RoundHooks};
use crate::ruler::RulerData;

/// Persists store state after each round.
pub type Checkpoint = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Coin settled every round; deposits are swept into `hot_address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinRound {
    pub coin_name: String,
    pub hot_address: String,
    #[serde(default = "default_sweep")]
    pub sweep_deposits: bool,
}

fn default_sweep() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub round_interval_ms: u64,
    pub coins: Vec<CoinRound>,
    /// Stop after this many rounds; `None` runs until shutdown.
    #[serde(default)]
    pub max_rounds: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            round_interval_ms: 5_000,
            coins: Vec::new(),
            max_rounds: None,
        }
    }
}

/// What one round did.
#[derive(Debug, Clone, Default)]
pub struct RoundSummary {
    pub task_round: u64,
    pub tip: Option<BlockNumber>,
    pub scanned: Vec<BlockNumber>,
    pub orders_touched: usize,
    pub orders_notified: usize,
    pub released: Vec<OrderId>,
    pub sweeps: Vec<OrderId>,
    pub settled: Vec<(String, SettleReport)>,
    pub rollback: Option<RollbackReport>,
    /// Scan failed this round; settlement still ran at the old cursor.
    pub scan_error: Option<String>,
    pub halted: bool,
    pub duration_ms: i64,
}

impl RoundSummary {
    pub fn new(task_round: u64) -> Self {
        Self {
            task_round,
            ..Self::default()
        }
    }
}

pub struct ChainRunner {
    chain: ChainKey,
    reconciler: Arc<OrderReconciler>,
    scanner: Arc<Scanner>,
    envelope: RoundEnvelope,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    ruler: RulerData,
    checkpoint: Option<Checkpoint>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ChainRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRunner")
            .field("chain", &self.chain)
            .field("task_round", &self.ruler.task_round)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChainRunner {
    /// Create a runner, restoring ruler data from the store.
    pub fn new(
        reconciler: Arc<OrderReconciler>,
        scanner: Arc<Scanner>,
        config: RunnerConfig,
    ) -> SchedulerResult<Self> {
        let chain = reconciler.chain().clone();
        let ruler = RulerData::load(reconciler.store().as_ref())?;
        Ok(Self {
            envelope: RoundEnvelope::new(chain.as_str(), Arc::new(NoopRoundHooks)),
            chain,
            reconciler,
            scanner,
            clock: Arc::new(SystemClock),
            config,
            ruler,
            checkpoint: None,
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn RoundHooks>) -> Self {
        self.envelope = RoundEnvelope::new(self.chain.as_str(), hooks);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn chain(&self) -> &ChainKey {
        &self.chain
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn ruler(&self) -> &RulerData {
        &self.ruler
    }

    pub fn task_round(&self) -> u64 {
        self.ruler.task_round
    }

    /// Run one closer round.
    pub async fn run_round(&mut self) -> SchedulerResult<RoundSummary> {
        let started = self.clock.now_ms();
        let mut ruler = self.envelope.closer_pre_hook(self.ruler.clone()).await;
        ruler.task_round += 1;
        let mut summary = RoundSummary::new(ruler.task_round);

        match self.scanner.scan_pass().await {
            Ok(report) => {
                summary.tip = Some(report.tip);
                summary.orders_touched = report.orders.len();
                summary.scanned = report.scanned;
                summary.rollback = report.rollback;
                summary.halted = self.scanner.halt().is_triggered();
            }
            Err(ScanError::Halted(reason)) => {
                warn!(chain = %self.chain, reason = %reason, "Scanning halted, settling only");
                summary.halted = true;
            }
            Err(e) if e.is_transient() => {
                warn!(chain = %self.chain, error = %e, "Scan pass failed, retrying next round");
                summary.scan_error = Some(e.to_string());
            }
            Err(e) => return Err(e.into()),
        }

        let bn = self.reconciler.current_bn();
        summary.released = self.reconciler.release_deferred(bn)?;
        summary.orders_notified = self.reconciler.notify_orders(bn).await?.len();

        // an unrecoverable reorg freezes value movement until resolved
        if !summary.halted {
            for coin in &self.config.coins {
                self.envelope
                    .tx_and_sweep_pre_hook(&coin.coin_name, &ruler)
                    .await;
                if coin.sweep_deposits {
                    let sweeps = self
                        .reconciler
                        .sweep_deposits(&coin.coin_name, &coin.hot_address, bn)
                        .await?;
                    summary.sweeps.extend(sweeps);
                }
                let report = self.reconciler.settle(&coin.coin_name, bn).await?;
                self.envelope
                    .tx_and_sweep_post_hook(&coin.coin_name, &report)
                    .await;
                summary.settled.push((coin.coin_name.clone(), report));
            }
        }

        ruler.last_scanned = self.reconciler.store().cursor();
        let finished = self.clock.now_ms();
        ruler.last_round_at = Some(finished);
        summary.duration_ms = finished.saturating_sub(started);

        let ruler = self.envelope.closer_post_hook(ruler, &summary).await;
        ruler.save(self.reconciler.store().as_ref())?;
        self.ruler = ruler;
        if let Err(e) = self.reconciler.flush_journal() {
            warn!(chain = %self.chain, error = %e, "Journal flush failed");
        }
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint() {
                warn!(chain = %self.chain, error = %e, "Checkpoint failed");
            }
        }

        Metrics::round_duration(self.chain.as_str(), summary.duration_ms as f64);
        debug!(
            chain = %self.chain,
            task_round = summary.task_round,
            scanned = summary.scanned.len(),
            notified = summary.orders_notified,
            sweeps = summary.sweeps.len(),
            duration_ms = summary.duration_ms,
            "Round complete"
        );
        Ok(summary)
    }

    /// Run rounds until shutdown or `max_rounds`.
    pub async fn run(mut self) -> SchedulerResult<u64> {
        let interval = Duration::from_millis(self.config.round_interval_ms);
        let mut rounds = 0u64;
        info!(
            chain = %self.chain,
            task_round = self.ruler.task_round,
            interval_ms = self.config.round_interval_ms,
            "Chain runner started"
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_round().await {
                error!(chain = %self.chain, error = %e, "Round failed");
            }
            rounds += 1;
            if self.config.max_rounds.is_some_and(|max| rounds >= max) {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        info!(chain = %self.chain, rounds, task_round = self.ruler.task_round, "Chain runner stopped");
        Ok(rounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use custody_chain::{ChainHandlers, SimulatedChain};
    use custody_core::{Address, AddressRole, ChainIdentity, DisplayAmount, OrderKind, OrderStatus};
    use custody_reconciler::ConfirmationPolicy;
    use custody_registry::AddressRegistry;
    use custody_scanner::ScannerConfig;
    use custody_store::{LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;

    fn runner(clock: MockClock) -> (ChainRunner, Arc<SimulatedChain>, Arc<MemoryStore>) {
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
            ConfirmationPolicy::default(),
        ));
        let scanner = Arc::new(Scanner::new(reconciler.clone(), ScannerConfig::default()));
        let config = RunnerConfig {
            round_interval_ms: 1,
            coins: vec![CoinRound {
                coin_name: "sim".to_string(),
                hot_address: "hot1".to_string(),
                sweep_deposits: true,
            }],
            max_rounds: None,
        };
        let runner = ChainRunner::new(reconciler, scanner, config)
            .unwrap()
            .with_clock(Arc::new(clock));
        (runner, sim, store)
    }

    fn ticking_clock() -> MockClock {
        let mut clock = MockClock::new();
        let mut now = 1_000;
        clock.expect_now_ms().returning(move || {
            now += 250;
            now
        });
        clock
    }

    #[tokio::test]
    async fn test_rounds_confirm_and_sweep_deposit() {
        let (mut runner, sim, store) = runner(ticking_clock());
        sim.submit_external("sim", "ext1", "dep1", DisplayAmount::new(dec!(5)));
        sim.mine();

        let first = runner.run_round().await.unwrap();
        assert_eq!(first.task_round, 1);
        assert_eq!(first.orders_touched, 1);
        assert!(first.sweeps.is_empty());
        assert_eq!(first.duration_ms, 250);

        sim.mine_blocks(6);
        let second = runner.run_round().await.unwrap();
        assert_eq!(second.task_round, 2);
        assert_eq!(second.sweeps.len(), 1);

        let sweep = store.order(second.sweeps[0]).unwrap();
        assert_eq!(sweep.kind, OrderKind::SweepToHot);
        assert_eq!(sweep.status, OrderStatus::Seen);
        assert_eq!(runner.ruler().last_scanned, Some(7));
    }

    #[tokio::test]
    async fn test_task_round_persisted_across_restart() {
        let (mut runner, _sim, store) = runner(ticking_clock());
        runner.run_round().await.unwrap();
        runner.run_round().await.unwrap();
        assert_eq!(runner.task_round(), 2);

        let restored = RulerData::load(store.as_ref() as &dyn LedgerStore).unwrap();
        assert_eq!(restored.task_round, 2);
        assert_eq!(restored.last_round_at, runner.ruler().last_round_at);
    }

    #[tokio::test]
    async fn test_checkpoint_runs_every_round() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (runner, _sim, _store) = runner(ticking_clock());
        let mut runner = runner.with_checkpoint(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        runner.run_round().await.unwrap();
        runner.run_round().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_stops_after_max_rounds() {
        let (mut runner, _sim, _store) = runner(ticking_clock());
        runner.config.max_rounds = Some(3);
        assert_eq!(runner.run().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let token = CancellationToken::new();
        let (runner, _sim, _store) = runner(ticking_clock());
        let runner = runner.with_shutdown(token.clone());
        token.cancel();
        assert_eq!(runner.run().await.unwrap(), 0);
    }
}
