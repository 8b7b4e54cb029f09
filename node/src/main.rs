// Meridian node binary
// Wires the chain core, mempool, PoA engine, and miner into a daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use chainlib::chain::{build_genesis, Chain};
use chainlib::consensus::{PoaEngine, UtxoStakeChecker, ValidatorTracker};
use chainlib::crypto::{pubkey_to_address, Keypair};
use chainlib::mempool::Mempool;
use chainlib::storage::{StorageError, UtxoSet};
use node::config::NodeConfig;
use node::miner::Miner;
use node::sink::NodeSink;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Meridian blockchain node", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Produce blocks with the configured signing key
    #[arg(long)]
    mine: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Generate a fresh validator keypair, print it, and exit
    #[arg(long)]
    generate_key: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.debug { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if args.generate_key {
        let keypair = Keypair::generate();
        println!("secret:  {}", hex::encode(keypair.secret_bytes()));
        println!("pubkey:  {}", hex::encode(keypair.public_key()));
        println!("address: {}", hex::encode(pubkey_to_address(&keypair.public_key())));
        return Ok(());
    }

    let config = NodeConfig::load(&args.config)?;
    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("starting Meridian node");
    info!(network = %config.node.network_name, data_dir = %config.node.data_dir);

    let mine = args.mine || config.miner.enable;
    let signer = match (&config.miner.key_file, mine) {
        (Some(path), true) => Some(load_signer(path)?),
        (None, true) => bail!("mining enabled but miner.key_file is not configured"),
        _ => None,
    };

    // single-validator devnet shortcut: an empty validator set with a
    // configured signer authorizes just that signer
    let mut validators = config.validator_keys()?;
    if validators.is_empty() {
        match &signer {
            Some(keypair) => {
                warn!("no validators configured; running single-validator devnet");
                validators.push(keypair.public_key());
            }
            None => bail!("consensus.validators is empty and no miner key is configured"),
        }
    }

    let poa = Arc::new(PoaEngine::new(validators, config.consensus.block_time)?);
    let pool = Arc::new(Mempool::new(config.mempool_config()));

    let db = sled::open(&config.node.data_dir).map_err(StorageError::from)?;
    let utxos = Arc::new(UtxoSet::new(&db)?);
    let sink = Arc::new(NodeSink::new(
        Arc::clone(&pool),
        Arc::clone(&poa),
        Arc::clone(&utxos),
    ));
    let chain = Arc::new(Chain::with_db(
        &db,
        config.chain_params(),
        Arc::clone(&poa),
        sink,
    )?);

    if chain.state()?.is_genesis() {
        let genesis = build_genesis(&config.genesis_config()?);
        chain
            .init_from_genesis(&genesis)
            .context("applying genesis block")?;
    }
    info!(
        height = chain.height()?,
        tip = %hex::encode(chain.tip_hash()?),
        supply = chain.supply()?,
        "chain ready"
    );

    pool.set_utxo_set(Arc::clone(&utxos))?;
    {
        let chain = Arc::clone(&chain);
        pool.set_height_source(move || chain.height().unwrap_or(0))?;
    }
    if config.consensus.min_stake > 0 {
        poa.set_stake_checker(Arc::new(UtxoStakeChecker::new(
            Arc::clone(&utxos),
            config.consensus.min_stake,
        )))?;
    }

    let tracker = Arc::new(ValidatorTracker::new(config.consensus.heartbeat_interval));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if let Some(keypair) = signer {
        let pubkey = keypair.public_key();
        let reward_address = match &config.miner.reward_address {
            Some(hex_address) => parse_address(hex_address)?,
            None => pubkey_to_address(&pubkey),
        };
        poa.set_signer(keypair)?;
        info!(
            signer = %hex::encode(pubkey),
            reward = %hex::encode(reward_address),
            "block production enabled"
        );

        let miner = Miner::new(
            Arc::clone(&chain),
            Arc::clone(&pool),
            Arc::clone(&poa),
            Arc::clone(&tracker),
            reward_address,
        );
        tasks.push(tokio::spawn(miner.run(shutdown_rx.clone())));

        // local liveness heartbeat
        let heartbeat_tracker = Arc::clone(&tracker);
        let interval = Duration::from_secs(config.consensus.heartbeat_interval.max(1));
        let mut heartbeat_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                heartbeat_tracker.record_heartbeat(pubkey);
                tokio::select! {
                    _ = heartbeat_shutdown.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn load_signer(path: &str) -> anyhow::Result<Keypair> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading miner key file {path}"))?;
    let bytes = hex::decode(raw.trim()).context("miner key file is not hex")?;
    Keypair::from_secret_bytes(&bytes).context("miner key file is not a valid secret key")
}

fn parse_address(hex_address: &str) -> anyhow::Result<[u8; 20]> {
    let bytes = hex::decode(hex_address.trim()).context("reward address is not hex")?;
    if bytes.len() != 20 {
        bail!("reward address is not 20 bytes");
    }
    let mut address = [0u8; 20];
    address.copy_from_slice(&bytes);
    Ok(address)
}
