use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scavenger_miner::address::{Address, UnimplementedSigner, WalletManager};
use scavenger_miner::config::Config;
use scavenger_miner::devfee::{DevFeeConfig, DevFeeRotator};
use scavenger_miner::hashengine::{HashEngineClient, HashEngineConfig};
use scavenger_miner::orchestrator::{MiningOrchestrator, OrchestratorConfig};
use scavenger_miner::receipts::ReceiptsStore;
use scavenger_miner::service::ScavengerClient;

#[derive(Parser)]
#[command(name = "scavenger-miner")]
#[command(about = "Distributed proof-of-work mining client for the scavenger challenge service", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mining orchestrator.
    Run {
        /// Configuration file path.
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Wallet address list (produced by an external signer/derivation tool).
        #[arg(short, long, default_value = "wallet.json")]
        wallet: String,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for config file.
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[derive(Debug, Deserialize)]
struct WalletAddressEntry {
    index: i64,
    bech32: String,
    public_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scavenger_miner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, wallet } => run(&config, &wallet).await?,
        Commands::Init { output } => {
            let config = Config::default();
            config.save(&output)?;
            info!("configuration file created at: {}", output);
        }
    }

    Ok(())
}

async fn run(config_path: &str, wallet_path: &str) -> Result<()> {
    let config = Config::load(config_path).with_context(|| format!("loading config from {}", config_path))?;
    std::fs::create_dir_all(&config.paths.state_dir).ok();

    let wallet_entries: Vec<WalletAddressEntry> = {
        let content = std::fs::read_to_string(wallet_path)
            .with_context(|| format!("loading wallet address list from {}", wallet_path))?;
        serde_json::from_str(&content)?
    };
    let addresses: Vec<Address> = wallet_entries
        .into_iter()
        .map(|e| Address::new(e.index, e.bech32, e.public_key))
        .collect();
    info!("loaded {} wallet addresses", addresses.len());
    let wallet = Arc::new(WalletManager::new(addresses, Arc::new(UnimplementedSigner)));

    let scavenger = ScavengerClient::new(config.service.base_url.clone())?;

    let hash_engine = Arc::new(HashEngineClient::new(HashEngineConfig {
        endpoint: config.hash_engine.endpoint.clone(),
        rom_init_timeout: config.hash_engine.rom_init_timeout_secs,
        request_timeout: config.service.request_timeout_secs,
    })?);

    let receipts = Arc::new(ReceiptsStore::new(
        config.paths.receipts_file.clone(),
        config.paths.errors_file.clone(),
    ));

    let dev_fee = if config.dev_fee.enabled {
        Some(Arc::new(DevFeeRotator::new(DevFeeConfig {
            endpoint: config.dev_fee.endpoint.clone(),
            cache_path: config.paths.dev_fee_cache_file.clone(),
            allowed_prefixes: config.dev_fee.allowed_prefixes.clone(),
            request_timeout: Duration::from_secs(10),
            ratio: Some(config.dev_fee.ratio),
        })?))
    } else {
        None
    };

    let orchestrator_config = OrchestratorConfig {
        worker_threads: config.mining.worker_threads,
        batch_size: config.mining.batch_size,
        worker_grouping_mode: config.mining.worker_grouping_mode,
        workers_per_address: config.mining.workers_per_address,
        max_submission_failures: config.mining.max_submission_failures,
    };

    let orchestrator = Arc::new(MiningOrchestrator::new(
        orchestrator_config,
        wallet,
        scavenger,
        hash_engine,
        receipts,
        dev_fee,
    ));

    info!("starting mining orchestrator");
    orchestrator.run().await
}
