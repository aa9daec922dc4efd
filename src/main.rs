use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, error, info};

use ledgerscan::config::Settings;
use ledgerscan::rpc::RpcClient;
use ledgerscan::scanner::Scanner;
use ledgerscan::store::LedgerStore;
use ledgerscan::telemetry::{self, TelemetryConfig};
use ledgerscan::types::Network;
use ledgerscan::metrics;

#[derive(Parser)]
#[command(name = "ledgerscan", about = "Bitcoin-compatible address-balance ledger scanner")]
struct Cli {
    /// Config file (TOML); defaults to ./ledgerscan.toml if present.
    #[arg(long)]
    config: Option<String>,

    /// Network: mainnet or testnet.
    #[arg(long)]
    network: Option<String>,

    /// Node RPC endpoint, e.g. http://127.0.0.1:8332.
    #[arg(long)]
    rpc_url: Option<String>,

    #[arg(long)]
    rpc_user: Option<String>,

    #[arg(long)]
    rpc_password: Option<String>,

    /// Ledger database directory.
    #[arg(long)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the chain and keep following the tip (default).
    Scan {
        /// Height to start from when the ledger is empty.
        #[arg(long)]
        start_height: Option<i64>,
    },
    /// Dump consolidated balances from the ledger, no network access.
    Balances {
        /// Minimum balance (sats) to include.
        #[arg(long, default_value_t = 0)]
        min: u64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "ledgerscan exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    telemetry::init_tracing(TelemetryConfig::default())?;
    metrics::register_metrics()?;

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(network) = &cli.network {
        settings.network = Network::from_str(network)?;
    }
    if let Some(url) = cli.rpc_url {
        settings.rpc.url = url;
    }
    if let Some(user) = cli.rpc_user {
        settings.rpc.user = user;
    }
    if let Some(password) = cli.rpc_password {
        settings.rpc.password = password;
    }
    if let Some(path) = cli.db_path {
        settings.store.path = path;
    }

    let db_path = PathBuf::from(shellexpand::tilde(&settings.store.path).into_owned());
    let network = settings.network;

    match cli.command.unwrap_or(Command::Scan { start_height: None }) {
        Command::Scan { start_height } => {
            if let Some(height) = start_height {
                settings.scanner.start_height = height;
            }
            info!(
                network = %network,
                rpc_url = %settings.rpc.url,
                db_path = %db_path.display(),
                "Starting ledgerscan"
            );

            let store = Arc::new(LedgerStore::open(
                &db_path,
                network,
                settings.scanner.max_rollback_depth,
            )?);
            let client = Arc::new(RpcClient::new(&settings.rpc)?);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received, stopping at next safe boundary");
                    let _ = shutdown_tx.send(true);
                }
            });

            let scanner = Scanner::new(
                client,
                Arc::clone(&store),
                network,
                settings.scanner.clone(),
                shutdown_rx,
            );

            // Fatal errors were already logged with the halting checkpoint.
            let stats = scanner.run().await?;

            match store.checkpoint()? {
                Some(cp) => info!(
                    height = cp.height,
                    hash = %telemetry::truncate_hex(&cp.hash, 16),
                    blocks_processed = stats.blocks_processed,
                    "Last confirmed block"
                ),
                None => info!("Ledger is empty, nothing was confirmed"),
            }
            debug!("Final metrics:\n{}", metrics::gather_metrics());
        }
        Command::Balances { min } => {
            let store = LedgerStore::open(
                &db_path,
                network,
                settings.scanner.max_rollback_depth,
            )?;
            match store.checkpoint()? {
                Some(cp) => info!(height = cp.height, "Balances as of checkpoint"),
                None => info!("Ledger is empty"),
            }
            let mut balances = store.balances(min)?;
            balances.sort_by(|a, b| b.1.cmp(&a.1));
            for (address, balance) in balances {
                println!("{} {}", address, balance);
            }
        }
    }

    Ok(())
}
