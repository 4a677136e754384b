use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gbt_miner::config::MinerConfig;
use gbt_miner::coordinator::Coordinator;
use gbt_miner::rpc::{NodeClient, RpcClient};
use gbt_miner::tracing::{self as logging, prelude::*};
use gbt_miner_core::difficulty::format_difficulty;
use gbt_miner_core::{CancellationToken, NonceStrategy};

/// Solo Bitcoin miner that mines blocks from a node's getblocktemplate
#[derive(Parser, Debug)]
#[command(name = "gbt-miner")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node RPC URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Node RPC user
    #[arg(long)]
    rpc_user: Option<String>,

    /// Node RPC password
    #[arg(long)]
    rpc_password: Option<String>,

    /// Address that receives the block reward
    #[arg(short, long)]
    payout_address: Option<String>,

    /// Number of search threads (default: all cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// incremental, random or mixed
    #[arg(long)]
    nonce_strategy: Option<NonceStrategy>,

    /// Text placed in the coinbase scriptSig
    #[arg(long)]
    message: Option<String>,

    /// Divide the template target by this factor (regtest only)
    #[arg(long)]
    difficulty_factor: Option<f64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut MinerConfig) {
        if let Some(url) = &self.rpc_url {
            config.rpc.url = url.clone();
        }
        if let Some(user) = &self.rpc_user {
            config.rpc.user = user.clone();
        }
        if let Some(password) = &self.rpc_password {
            config.rpc.password = password.clone();
        }
        if let Some(address) = &self.payout_address {
            config.mining.payout_address = Some(address.clone());
            config.mining.payout_script = None;
        }
        if let Some(workers) = self.workers {
            config.mining.workers = Some(workers);
        }
        if let Some(strategy) = self.nonce_strategy {
            config.mining.nonce_strategy = strategy;
        }
        if let Some(message) = &self.message {
            config.mining.coinbase_message = message.clone();
        }
        if let Some(factor) = self.difficulty_factor {
            config.mining.difficulty_factor = Some(factor);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_stdout(args.verbose);

    let mut config = match &args.config {
        Some(path) => MinerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => MinerConfig::default(),
    };
    args.apply(&mut config);

    let client = RpcClient::new(
        &config.rpc.url,
        &config.rpc.user,
        &config.rpc.password,
        Duration::from_secs(config.rpc.timeout_secs),
    )
    .context("creating RPC client")?;

    let info = client
        .get_blockchain_info()
        .with_context(|| format!("querying node at {}", config.rpc.url))?;
    let Some(network) = info.network() else {
        bail!("node reports unknown chain {:?}", info.chain);
    };
    info!(
        chain = %info.chain,
        blocks = info.blocks,
        difficulty = %format_difficulty(info.difficulty),
        "Connected to node"
    );

    let settings = config.validate(network).context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || {
        if handler_token.cancel() {
            info!("Shutting down");
        }
    })
    .context("installing Ctrl-C handler")?;

    let mut coordinator = Coordinator::new(Arc::new(client), settings, shutdown);
    coordinator.run()?;

    Ok(())
}
