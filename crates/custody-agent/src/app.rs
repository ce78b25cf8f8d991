//! Main application orchestration.
//!
//! One [`ChainRuntime`] per configured chain: store, registry, reconciler,
//! scanner, host client and round runner. Every chain runs in its own task;
//! Ctrl-C cancels them all between blocks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use custody_chain::{ChainHandlers, ChainRegistry, SimulatedChain};
use custody_core::{ChainKey, SystemAddressKind};
use custody_reconciler::OrderReconciler;
use custody_registry::{AddressRegistry, SeedVault};
use custody_scanner::Scanner;
use custody_scheduler::{ChainRunner, CoinRound, RunnerConfig};
use custody_store::{JournalWriter, LedgerStore, MemoryStore};
use custody_telemetry::Metrics;

use crate::client::LedgerClient;
use crate::config::{AppConfig, ChainConfig};
use crate::error::{AppError, AppResult};

/// Seed used by chains that run in simulation without configured key material.
const SIMULATION_SEED_HEX: &str = "73696d756c6174696f6e2d73656564";

/// Snapshot file name inside a chain directory.
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Prometheus text exposition written to the data directory on shutdown.
const METRICS_FILE: &str = "metrics.prom";

/// Everything one chain needs at runtime.
pub struct ChainRuntime {
    pub key: ChainKey,
    pub client: Arc<LedgerClient>,
    pub runner: ChainRunner,
    pub store: Arc<MemoryStore>,
    /// Present in simulation mode.
    pub sim: Option<Arc<SimulatedChain>>,
    snapshot_path: PathBuf,
}

impl std::fmt::Debug for ChainRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRuntime")
            .field("key", &self.key)
            .field("snapshot_path", &self.snapshot_path)
            .field("simulated", &self.sim.is_some())
            .finish_non_exhaustive()
    }
}

impl ChainRuntime {
    /// Persist the store snapshot.
    pub fn save(&self) -> AppResult<()> {
        self.store.save(&self.snapshot_path)?;
        Ok(())
    }

    pub fn snapshot_path(&self) -> &PathBuf {
        &self.snapshot_path
    }
}

/// Main application.
#[derive(Debug)]
pub struct Application {
    config: AppConfig,
    chains: Vec<ChainRuntime>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build every configured chain against adapters registered in `adapters`.
    pub async fn new(config: AppConfig, adapters: &ChainRegistry) -> AppResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let mut chains = Vec::with_capacity(config.chains.len());
        for chain_cfg in &config.chains {
            let handlers = adapters
                .get(&chain_cfg.chain_key())
                .map_err(|_| AppError::UnknownChain(chain_cfg.key.clone()))?;
            let vault = SeedVault::load(&chain_cfg.key_source())?;
            chains.push(build_chain(&config, chain_cfg, handlers, vault, None, &shutdown).await?);
        }
        Ok(Self {
            config,
            chains,
            shutdown,
        })
    }

    /// Build every configured chain against an in-process [`SimulatedChain`].
    pub async fn simulated(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let mut chains = Vec::with_capacity(config.chains.len());
        for chain_cfg in &config.chains {
            let sim = chain_cfg
                .coins
                .iter()
                .fold(SimulatedChain::new(chain_cfg.identity()), |sim, coin| {
                    sim.with_coin(coin.name.clone(), coin.decimals)
                });
            let sim = Arc::new(sim);
            let handlers = Arc::new(ChainHandlers::new(sim.clone()).with_stake_handler(sim.clone()));
            let vault = match SeedVault::load(&chain_cfg.key_source()) {
                Ok(vault) => vault,
                Err(e) => {
                    warn!(chain = %chain_cfg.key, error = %e, "No key material, using the simulation seed");
                    SeedVault::from_hex(SIMULATION_SEED_HEX)?
                }
            };
            chains.push(build_chain(&config, chain_cfg, handlers, vault, Some(sim), &shutdown).await?);
        }
        Ok(Self {
            config,
            chains,
            shutdown,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn chains(&self) -> &[ChainRuntime] {
        &self.chains
    }

    pub fn chains_mut(&mut self) -> &mut [ChainRuntime] {
        &mut self.chains
    }

    pub fn chain(&self, key: &str) -> Option<&ChainRuntime> {
        let key = ChainKey::new(key);
        self.chains.iter().find(|c| c.key == key)
    }

    pub fn chain_mut(&mut self, key: &str) -> Option<&mut ChainRuntime> {
        let key = ChainKey::new(key);
        self.chains.iter_mut().find(|c| c.key == key)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every chain until Ctrl-C or the configured round limit.
    pub async fn run(self) -> AppResult<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });

        let mut handles = Vec::with_capacity(self.chains.len());
        for runtime in self.chains {
            let interval = runtime.runner.config().round_interval_ms;
            if let Some(sim) = runtime.sim.clone() {
                tokio::spawn(produce_blocks(sim, interval, self.shutdown.clone()));
            }
            handles.push(tokio::spawn(run_chain(runtime)));
        }
        let total = handles.len();
        info!(chains = total, "Entering main loop");

        let mut failed = 0usize;
        for result in join_all(handles).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    error!(error = %e, "Chain task failed");
                }
                Err(e) => {
                    failed += 1;
                    error!(error = %e, "Chain task panicked");
                }
            }
        }
        self.shutdown.cancel();
        if let Err(e) = write_metrics(&self.config) {
            warn!(error = %e, "Failed to write metrics exposition");
        }
        info!(failed, "Shut down");
        if failed > 0 {
            return Err(AppError::ChainTasksFailed { failed, total });
        }
        Ok(())
    }
}

fn write_metrics(config: &AppConfig) -> AppResult<()> {
    let dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(METRICS_FILE), Metrics::gather()?)?;
    Ok(())
}

async fn build_chain(
    config: &AppConfig,
    chain_cfg: &ChainConfig,
    handlers: Arc<ChainHandlers>,
    vault: SeedVault,
    sim: Option<Arc<SimulatedChain>>,
    shutdown: &CancellationToken,
) -> AppResult<ChainRuntime> {
    let key = chain_cfg.chain_key();
    let dir = config.chain_dir(&key);
    let snapshot_path = dir.join(SNAPSHOT_FILE);

    let store = Arc::new(MemoryStore::load_or_new(&snapshot_path)?);
    let registry = Arc::new(AddressRegistry::new());
    registry.restore(store.addresses());

    let journal = JournalWriter::new(dir.join("journal"), key.as_str(), config.journal_buffer_size);
    let reconciler = Arc::new(
        OrderReconciler::new(handlers, store.clone(), registry, chain_cfg.policy())
            .with_journal(journal),
    );
    let scanner = Arc::new(
        Scanner::new(reconciler.clone(), chain_cfg.scanner_config())
            .with_shutdown(shutdown.child_token()),
    );
    let client = Arc::new(LedgerClient::new(chain_cfg, reconciler.clone(), scanner.clone()));
    client.init_from_seed(vault).await?;

    let mut coins = Vec::with_capacity(chain_cfg.coins.len());
    for coin in &chain_cfg.coins {
        coins.push(CoinRound {
            coin_name: coin.name.clone(),
            hot_address: client
                .get_system_address(&coin.name, SystemAddressKind::Hot)
                .await?,
            sweep_deposits: coin.sweep_deposits,
        });
    }
    let runner_cfg = RunnerConfig {
        round_interval_ms: chain_cfg.round_interval_ms,
        coins,
        max_rounds: config.max_rounds,
    };
    let checkpoint_store = store.clone();
    let checkpoint_path = snapshot_path.clone();
    let runner = ChainRunner::new(reconciler, scanner, runner_cfg)?
        .with_checkpoint(Arc::new(move || {
            checkpoint_store.save(&checkpoint_path)?;
            Ok(())
        }))
        .with_shutdown(shutdown.child_token());

    info!(
        chain = %key,
        cursor = ?store.cursor(),
        orders = store.all_orders().len(),
        addresses = store.addresses().len(),
        simulated = sim.is_some(),
        "Chain ready"
    );
    Ok(ChainRuntime {
        key,
        client,
        runner,
        store,
        sim,
        snapshot_path,
    })
}

async fn run_chain(runtime: ChainRuntime) -> AppResult<()> {
    let ChainRuntime {
        key,
        client,
        runner,
        store,
        snapshot_path,
        ..
    } = runtime;
    let rounds = runner.run().await?;
    if let Err(e) = client.reconciler().flush_journal() {
        warn!(chain = %key, error = %e, "Final journal flush failed");
    }
    store.save(&snapshot_path)?;
    info!(chain = %key, rounds, "Chain stopped");
    Ok(())
}

/// Mine one simulated block per round interval.
async fn produce_blocks(sim: Arc<SimulatedChain>, interval_ms: u64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sim.mine();
            }
            () = shutdown.cancelled() => break,
        }
    }
}
