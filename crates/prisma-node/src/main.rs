//! prismad — the Prisma full-node binary.
//!
//! Startup sequence:
//!   1. Load configuration and the wallet keyfile
//!   2. Open (or initialise) the store; load the genesis state if fresh
//!   3. Re-verify stored events and restore the consensus engine
//!   4. Start the sync service (get_peers / get_events / get_state timers)
//!   5. Run until ctrl-c

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;
use tracing::info;

use prisma_core::constants::DEFAULT_TOTAL_STAKE;
use prisma_crypto::WalletKeys;
use prisma_graph::Graph;
use prisma_p2p::{NetworkConfig, NetworkService};
use prisma_state::genesis::sync_genesis;
use prisma_store::StoreDb;

use config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "prismad",
    version,
    about = "Prisma node — hashgraph-ordered transaction ledger"
)]
struct Args {
    /// Path to the configuration JSON.
    #[arg(long, default_value = "prisma.json")]
    config: PathBuf,

    /// Override the store directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the listen port from the config file.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Wallet keyfile (created on first run).
    #[arg(long, default_value = "~/.prisma/wallet.json")]
    wallet: PathBuf,

    /// Genesis state file; defaults next to the config, named per network.
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Total voting stake of the network.
    #[arg(long, default_value_t = DEFAULT_TOTAL_STAKE)]
    total_stake: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prisma=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("starting prismad");

    let config = Config::load_or_default(&args.config).context("loading configuration")?;

    // ── Wallet ────────────────────────────────────────────────────────────────
    let wallet_path = expand_tilde(&args.wallet);
    let wallet = WalletKeys::load_or_create(&wallet_path).context("opening wallet keyfile")?;
    let keypair = wallet.keypair().context("restoring node keypair")?;
    info!(address = %wallet.address, "wallet unlocked");

    // ── Store ─────────────────────────────────────────────────────────────────
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.database));
    let data_dir = expand_tilde(&data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = Arc::new(StoreDb::open(&data_dir).context("opening store")?);

    // ── Genesis ───────────────────────────────────────────────────────────────
    let genesis_path = args.genesis.clone().unwrap_or_else(|| {
        let name = config.general.network.genesis_file_name();
        args.config
            .parent()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    });
    if genesis_path.exists() {
        sync_genesis(&store, &genesis_path).context("loading genesis state")?;
    } else {
        info!(path = %genesis_path.display(), "no genesis file; relying on state sync");
    }

    // ── Consensus engine ──────────────────────────────────────────────────────
    let mut graph =
        Graph::new(Arc::clone(&store), keypair, args.total_stake).context("building engine")?;
    graph.init().context("restoring consensus engine")?;
    let verify_key = graph.verify_key().clone();
    let graph = Arc::new(Mutex::new(graph));

    // ── Network service ───────────────────────────────────────────────────────
    let net_config = NetworkConfig {
        listen_port: args.listen_port.unwrap_or(config.network.listen_port),
        get_peers_timer: config.network.get_peers_timer,
        get_events_timer: config.network.get_events_timer,
        timeout_secs: config.network.timeout,
        zlib_level: config.network.zlib_level,
        developer_mode: config.developer.developer_mode,
        bootstrap_nodes: config.bootstrap.bootstrap_nodes.clone(),
    };
    let service = Arc::new(NetworkService::new(
        net_config,
        Arc::clone(&graph),
        Arc::clone(&store),
        &verify_key,
    ));

    tokio::select! {
        result = service.run() => {
            result.context("network service stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    store.flush().context("flushing store")?;
    Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
