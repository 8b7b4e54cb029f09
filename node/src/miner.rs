//! PoA block production. One attempt per slot: the in-turn signer goes
//! immediately, backups wait their deterministic delay and stand down if a
//! block lands first.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use chainlib::chain::{Chain, ChainError, ChainState};
use chainlib::consensus::{PoaEngine, ValidatorTracker};
use chainlib::mempool::Mempool;
use chainlib::types::block::{Block, BlockHeader};
use chainlib::types::transaction::{Script, Transaction, TxOutput};
use chainlib::types::{Address, BLOCK_VERSION, ZERO_HASH};
use chainlib::validation::validate_with_utxos;

pub struct Miner {
    chain: Arc<Chain>,
    mempool: Arc<Mempool>,
    poa: Arc<PoaEngine>,
    tracker: Arc<ValidatorTracker>,
    reward_address: Address,
}

impl Miner {
    pub fn new(
        chain: Arc<Chain>,
        mempool: Arc<Mempool>,
        poa: Arc<PoaEngine>,
        tracker: Arc<ValidatorTracker>,
        reward_address: Address,
    ) -> Self {
        Self {
            chain,
            mempool,
            poa,
            tracker,
            reward_address,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("miner started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("miner stopping");
                    return;
                }
                _ = sleep(Duration::from_millis(250)) => {}
            }
            if let Err(err) = self.try_produce(&mut shutdown).await {
                warn!(%err, "block production attempt failed");
            }
        }
    }

    async fn try_produce(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let signer = match self.poa.local_signer()? {
            Some(signer) => signer,
            None => return Ok(()),
        };
        let now = unix_now();
        let state = self.chain.state()?;

        // one block per slot
        let block_time = self.poa.block_time();
        if state.tip_timestamp / block_time >= now / block_time {
            return Ok(());
        }
        if self.chain.is_signing_limit_reached(&signer)? {
            debug!("signing limit reached; skipping slot");
            self.tracker.record_missed(signer);
            return Ok(());
        }

        // out-of-turn signers yield the slot to its owner first
        let delay = self.poa.backup_delay(now)?;
        if !delay.is_zero() {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = sleep(delay) => {}
            }
            if self.chain.state()?.tip_hash != state.tip_hash {
                return Ok(());
            }
        }

        let block = self.assemble(&state, now)?;
        let height = block.header.height;
        match self.chain.process_block(&block) {
            Ok(()) => {
                self.tracker.record_block(signer);
                info!(
                    height,
                    hash = %hex::encode(block.hash()),
                    txs = block.transactions.len(),
                    "produced block"
                );
            }
            // someone else served the slot; nothing to do
            Err(ChainError::BlockKnown) | Err(ChainError::ForkDetected) => {}
            Err(err) => return Err(err).context("submitting produced block"),
        }
        Ok(())
    }

    fn assemble(&self, state: &ChainState, timestamp: u64) -> anyhow::Result<Block> {
        let params = self.chain.params();
        let height = state.height + 1;
        let utxos = self.chain.utxo_set()?;

        let candidates = self
            .mempool
            .select_for_block(params.max_block_txs.saturating_sub(1))?;
        let mut fees: u64 = 0;
        let mut included: Vec<Transaction> = Vec::with_capacity(candidates.len());
        for tx in candidates {
            // drop entries that went stale since admission
            let validated = match validate_with_utxos(&tx, utxos.as_ref(), &params.tx_policy()) {
                Ok(validated) => validated,
                Err(err) => {
                    debug!(hash = %hex::encode(tx.hash()), %err, "skipping stale mempool entry");
                    continue;
                }
            };
            let blocked = validated.spent.iter().any(|utxo| {
                (utxo.is_coinbase
                    && height.saturating_sub(utxo.height) < params.coinbase_maturity)
                    || (utxo.locked_until > 0 && height < utxo.locked_until)
            });
            if blocked {
                continue;
            }
            fees = fees.saturating_add(validated.fee);
            included.push(tx);
        }
        included.sort_by_key(|tx| tx.hash());

        let reward = if params.max_supply > 0 {
            params
                .block_reward
                .min(params.max_supply.saturating_sub(state.supply))
        } else {
            params.block_reward
        };
        let coinbase = Transaction::coinbase(
            height,
            vec![TxOutput {
                value: reward.saturating_add(fees),
                script: Script::pay_to_address(&self.reward_address),
                token: None,
            }],
        );

        let mut transactions = vec![coinbase];
        transactions.extend(included);
        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: state.tip_hash,
                merkle_root: ZERO_HASH,
                timestamp,
                height,
                difficulty: 0,
                nonce: 0,
                validator_sig: Vec::new(),
            },
            transactions,
        };
        self.poa.prepare(&mut block.header)?;
        block.header.merkle_root = block.compute_merkle_root();
        self.poa.seal(&mut block)?;
        Ok(block)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
