//! Custody agent entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use custody_agent::{AppConfig, Application};
use custody_chain::ChainRegistry;

/// Multi-chain custody reconciliation agent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via CUSTODY_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Run every configured chain against the in-process simulated adapter
    #[arg(long)]
    simulate: bool,

    /// Stop every chain after this many rounds
    #[arg(long)]
    rounds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    custody_telemetry::init_logging()?;

    info!("Starting custody agent v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > CUSTODY_CONFIG > default
    let config_path = args
        .config
        .or_else(|| std::env::var("CUSTODY_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let mut config = AppConfig::from_file(&config_path)?;
    if args.rounds.is_some() {
        config.max_rounds = args.rounds;
    }
    let simulate = args.simulate || config.simulate;
    info!(
        chains = config.chains.len(),
        simulate,
        max_rounds = ?config.max_rounds,
        data_dir = %config.data_dir,
        "Configuration loaded"
    );

    let app = if simulate {
        Application::simulated(config).await?
    } else {
        // node adapters are linked in by embedding crates; the bare binary has none
        Application::new(config, &ChainRegistry::new()).await?
    };

    app.run().await?;

    Ok(())
}
