//! The chain state machine. `process_block` is the single accepting path;
//! every state-mutating entry point serializes on one lock, and observers
//! are notified through the [`EventSink`] after each commit.

pub mod events;
pub mod genesis;
pub mod params;
mod reorg;

pub use events::{ChainEvent, EventSink, NullSink};
pub use genesis::{build_genesis, GenesisConfig};
pub use params::ChainParams;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::poa::{PoaEngine, PoaError};
use crate::crypto::signature::PUBKEY_LEN;
use crate::storage::{BlockStore, StorageError, StoredState, UndoRecord, Utxo, UtxoSet};
use crate::types::block::Block;
use crate::types::transaction::{ScriptType, Transaction};
use crate::types::{Hash, OutPoint, ZERO_HASH};
use crate::validation::{
    check_block_structure, check_stake_outputs, check_token_rules, validate_with_utxos,
    BlockValidationError, TxValidationError,
};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block already known")]
    BlockKnown,

    #[error("previous block not found")]
    PrevNotFound,

    #[error("fork detected; branch does not outweigh the active chain")]
    ForkDetected,

    #[error("bad height: expected {expected}, got {got}")]
    BadHeight { expected: u64, got: u64 },

    #[error("bad previous hash")]
    BadPrevHash,

    #[error("chain already initialized")]
    AlreadyInitialized,

    #[error("block timestamp {ts} too far in the future (now {now})")]
    TimestampTooFuture { ts: u64, now: u64 },

    #[error("block timestamp {ts} before parent {parent}")]
    TimestampBeforeParent { ts: u64, parent: u64 },

    #[error("coinbase input not yet mature")]
    CoinbaseNotMature,

    #[error("input locked until height {unlock_height}")]
    OutputLocked { unlock_height: u64 },

    #[error("coinbase mints more than the allowed reward")]
    CoinbaseRewardExceeded,

    #[error("signer exceeded the signing limit")]
    SigningLimitExceeded,

    #[error("reorg depth {depth} exceeds maximum {max}")]
    ReorgTooDeep { depth: u64, max: u64 },

    #[error("reorganization would replace genesis")]
    GenesisReorg,

    #[error("supply underflow during revert")]
    SupplyUnderflow,

    #[error("supply overflow")]
    SupplyOverflow,

    #[error("failed to apply UTXO change: {0}")]
    ApplyUtxo(String),

    #[error("chain lock poisoned")]
    LockPoisoned,

    #[error("core inconsistency: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Block(#[from] BlockValidationError),

    #[error(transparent)]
    Tx(#[from] TxValidationError),

    #[error(transparent)]
    Consensus(#[from] PoaError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// In-memory chain state, mirrored to the store on every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub tip_hash: Hash,
    pub height: u64,
    pub supply: u64,
    pub cumulative_difficulty: u64,
    pub tip_timestamp: u64,
}

impl ChainState {
    /// True before any block, genesis included, has been accepted.
    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.tip_hash == ZERO_HASH
    }

    fn to_stored(self) -> StoredState {
        StoredState {
            tip_hash: self.tip_hash,
            height: self.height,
            supply: self.supply,
            cumulative_difficulty: self.cumulative_difficulty,
        }
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            tip_hash: ZERO_HASH,
            height: 0,
            supply: 0,
            cumulative_difficulty: 0,
            tip_timestamp: 0,
        }
    }
}

pub(crate) struct ChainInner {
    pub(crate) store: BlockStore,
    pub(crate) utxos: Arc<UtxoSet>,
    pub(crate) state: ChainState,
    pub(crate) genesis_hash: Hash,
}

/// The chain. All mutation (`process_block`, `init_from_genesis`, reorg,
/// rebuild) serializes on one mutex; read queries take the same lock
/// briefly and never suspend while holding it.
pub struct Chain {
    inner: Mutex<ChainInner>,
    params: ChainParams,
    poa: Arc<PoaEngine>,
    sink: Arc<dyn EventSink>,
}

impl Chain {
    /// Open (or create) a chain at `path`. If a reorg checkpoint is
    /// present, the UTXO set is rebuilt before the chain accepts blocks.
    pub fn open<P: AsRef<Path>>(
        path: P,
        params: ChainParams,
        poa: Arc<PoaEngine>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ChainError> {
        let db = sled::open(path).map_err(StorageError::from)?;
        Self::with_db(&db, params, poa, sink)
    }

    /// Open a chain over an existing sled handle.
    pub fn with_db(
        db: &sled::Db,
        params: ChainParams,
        poa: Arc<PoaEngine>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ChainError> {
        let store = BlockStore::new(db)?;
        let utxos = Arc::new(UtxoSet::new(db)?);

        let state = match store.get_state()? {
            Some(stored) => ChainState {
                tip_hash: stored.tip_hash,
                height: stored.height,
                supply: stored.supply,
                cumulative_difficulty: stored.cumulative_difficulty,
                tip_timestamp: 0,
            },
            None => ChainState::default(),
        };
        let genesis_hash = store.get_hash_by_height(0)?.unwrap_or(ZERO_HASH);

        let chain = Self {
            inner: Mutex::new(ChainInner {
                store,
                utxos,
                state,
                genesis_hash,
            }),
            params,
            poa,
            sink,
        };

        {
            let mut inner = chain.locked()?;
            // an interrupted reorg leaves its checkpoint behind; the UTXO
            // set must be reconstructed before any block is accepted
            chain.recover_checkpoint(&mut inner)?;
            if inner.state.tip_hash != ZERO_HASH {
                let tip = inner
                    .store
                    .get_block(&inner.state.tip_hash)?
                    .ok_or_else(|| ChainError::Corrupt("tip block missing".to_string()))?;
                inner.state.tip_timestamp = tip.header.timestamp;
            }
        }
        Ok(chain)
    }

    fn locked(&self) -> Result<MutexGuard<'_, ChainInner>, ChainError> {
        self.inner.lock().map_err(|_| ChainError::LockPoisoned)
    }

    // ---- read API ----

    pub fn state(&self) -> Result<ChainState, ChainError> {
        Ok(self.locked()?.state)
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        Ok(self.locked()?.state.height)
    }

    pub fn tip_hash(&self) -> Result<Hash, ChainError> {
        Ok(self.locked()?.state.tip_hash)
    }

    pub fn supply(&self) -> Result<u64, ChainError> {
        Ok(self.locked()?.state.supply)
    }

    pub fn cumulative_difficulty(&self) -> Result<u64, ChainError> {
        Ok(self.locked()?.state.cumulative_difficulty)
    }

    pub fn genesis_hash(&self) -> Result<Hash, ChainError> {
        Ok(self.locked()?.genesis_hash)
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        Ok(self.locked()?.store.get_block(hash)?)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, ChainError> {
        Ok(self.locked()?.store.get_block_by_height(height)?)
    }

    pub fn get_transaction(&self, hash: &Hash) -> Result<Option<Transaction>, ChainError> {
        let inner = self.locked()?;
        let location = match inner.store.get_tx_location(hash)? {
            Some(location) => location,
            None => return Ok(None),
        };
        let block = inner
            .store
            .get_block(&location.block_hash)?
            .ok_or_else(|| ChainError::Corrupt("tx index references missing block".to_string()))?;
        Ok(block.transactions.into_iter().find(|tx| tx.hash() == *hash))
    }

    /// Shared handle to the UTXO set for mempool maturity reads and the
    /// stake checker. Writers all funnel through the chain.
    pub fn utxo_set(&self) -> Result<Arc<UtxoSet>, ChainError> {
        Ok(Arc::clone(&self.locked()?.utxos))
    }

    /// Whether `pubkey` signed any of the last `signing_limit - 1` blocks.
    /// Miners use this for self-throttling.
    pub fn is_signing_limit_reached(&self, pubkey: &[u8; PUBKEY_LEN]) -> Result<bool, ChainError> {
        let inner = self.locked()?;
        let next_height = inner.state.height.saturating_add(1);
        self.signer_in_window(&inner.store, pubkey, next_height)
    }

    fn signer_in_window(
        &self,
        store: &BlockStore,
        pubkey: &[u8; PUBKEY_LEN],
        at_height: u64,
    ) -> Result<bool, ChainError> {
        let limit = self.poa.signing_limit()?;
        if limit == 0 || at_height <= 1 {
            return Ok(false);
        }
        let from = at_height.saturating_sub(limit - 1).max(1);
        for height in from..at_height {
            let block = match store.get_block_by_height(height)? {
                Some(block) => block,
                None => continue,
            };
            if self.poa.identify_signer(&block.header)? == Some(*pubkey) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- genesis ----

    /// Accept the height-0 block. Fails once any block has been applied.
    pub fn init_from_genesis(&self, genesis: &Block) -> Result<(), ChainError> {
        let events = {
            let mut inner = self.locked()?;
            if inner.genesis_hash != ZERO_HASH || !inner.state.is_genesis() {
                return Err(ChainError::AlreadyInitialized);
            }
            if genesis.header.height != 0 {
                return Err(ChainError::BadHeight {
                    expected: 0,
                    got: genesis.header.height,
                });
            }
            if genesis.header.prev_hash != ZERO_HASH {
                return Err(ChainError::BadPrevHash);
            }
            if genesis.transactions.is_empty() {
                return Err(BlockValidationError::NoCoinbase.into());
            }
            if genesis.compute_merkle_root() != genesis.header.merkle_root {
                return Err(BlockValidationError::BadMerkleRoot.into());
            }

            let hash = genesis.hash();
            let mut supply: u64 = 0;
            for tx in &genesis.transactions {
                for output in &tx.outputs {
                    supply = supply
                        .checked_add(output.value)
                        .ok_or(ChainError::SupplyOverflow)?;
                }
            }
            if self.params.max_supply > 0 && supply > self.params.max_supply {
                return Err(ChainError::SupplyOverflow);
            }

            let mut events = vec![ChainEvent::BlockApplied(genesis.clone())];
            for tx in &genesis.transactions {
                let tx_hash = tx.hash();
                for (vout, output) in tx.outputs.iter().enumerate() {
                    // genesis grants are spendable immediately
                    let utxo = Utxo {
                        outpoint: OutPoint::new(tx_hash, vout as u32),
                        value: output.value,
                        script: output.script.clone(),
                        token: output.token,
                        height: 0,
                        is_coinbase: false,
                        locked_until: 0,
                    };
                    inner.utxos.put(&utxo)?;
                    match output.script.script_type {
                        ScriptType::Register => events.push(ChainEvent::Registered {
                            output: output.clone(),
                            tx_hash,
                            height: 0,
                        }),
                        ScriptType::Stake => events.push(ChainEvent::Staked(utxo)),
                        _ => {}
                    }
                }
            }

            let state = ChainState {
                tip_hash: hash,
                height: 0,
                supply,
                cumulative_difficulty: genesis.header.difficulty,
                tip_timestamp: genesis.header.timestamp,
            };
            inner.store.put_block(genesis)?;
            inner.store.put_state(&state.to_stored())?;
            inner.store.flush()?;
            inner.state = state;
            inner.genesis_hash = hash;
            info!(hash = %hex::encode(hash), supply, "chain initialized from genesis");
            events
        };
        events::dispatch(self.sink.as_ref(), &events);
        Ok(())
    }

    // ---- block processing ----

    /// The single accepting path for blocks above genesis.
    pub fn process_block(&self, block: &Block) -> Result<(), ChainError> {
        let events = {
            let mut inner = self.locked()?;
            self.process_block_locked(&mut inner, block)?
        };
        events::dispatch(self.sink.as_ref(), &events);
        Ok(())
    }

    fn process_block_locked(
        &self,
        inner: &mut ChainInner,
        block: &Block,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let hash = block.hash();
        if inner.store.has_block(&hash)? {
            return Err(ChainError::BlockKnown);
        }
        if inner.genesis_hash == ZERO_HASH {
            // not initialized; the caller must apply genesis first
            return Err(ChainError::PrevNotFound);
        }

        if block.header.prev_hash == inner.state.tip_hash {
            // fast path: extends the current tip
            let expected = inner.state.height + 1;
            if block.header.height != expected {
                return Err(ChainError::BadHeight {
                    expected,
                    got: block.header.height,
                });
            }
            self.verify_block_full(&inner.store, block, inner.state.tip_timestamp)?;
            let (spent, minted) =
                self.validate_stateful(&inner.utxos, block, inner.state.supply)?;
            let (undo, apply_events) =
                apply_block(&inner.utxos, &self.params, block, &spent, minted)?;

            let new_state = next_state(&inner.state, block, minted)?;
            inner.store.commit_block(block, &undo, &new_state.to_stored())?;
            inner.state = new_state;
            debug!(height = new_state.height, hash = %hex::encode(hash), "block connected");

            let mut events = vec![ChainEvent::BlockApplied(block.clone())];
            events.extend(apply_events);
            Ok(events)
        } else if let Some(parent) = inner.store.get_block(&block.header.prev_hash)? {
            // fork: parent is known but is not the tip
            let expected = parent.header.height + 1;
            if block.header.height != expected {
                return Err(ChainError::BadHeight {
                    expected,
                    got: block.header.height,
                });
            }
            inner.store.store_block(block)?;
            debug!(height = block.header.height, hash = %hex::encode(hash), "fork block stored");
            match self.reorg(inner, hash)? {
                Some(events) => Ok(events),
                // branch did not outweigh the active chain; informational
                None => Err(ChainError::ForkDetected),
            }
        } else {
            // unknown parent; sync uses this to request ancestors
            Err(ChainError::PrevNotFound)
        }
    }

    /// Header-level validation shared by the fast path and reorg replay:
    /// structure, timestamps, consensus signature and difficulty, and the
    /// optional signing-limit policy.
    pub(crate) fn verify_block_full(
        &self,
        store: &BlockStore,
        block: &Block,
        parent_timestamp: u64,
    ) -> Result<(), ChainError> {
        check_block_structure(block, &self.params.block_policy())?;

        let now = unix_now();
        if block.header.timestamp > now + self.params.max_future_drift {
            return Err(ChainError::TimestampTooFuture {
                ts: block.header.timestamp,
                now,
            });
        }
        if block.header.height > 0 && block.header.timestamp < parent_timestamp {
            return Err(ChainError::TimestampBeforeParent {
                ts: block.header.timestamp,
                parent: parent_timestamp,
            });
        }

        self.poa.verify_header(&block.header)?;

        if self.params.enforce_signing_limit {
            if let Some(signer) = self.poa.identify_signer(&block.header)? {
                if self.signer_in_window(store, &signer, block.header.height)? {
                    return Err(ChainError::SigningLimitExceeded);
                }
            }
        }
        Ok(())
    }

    /// State-dependent validation (shared with reorg replay): per-tx UTXO
    /// validation with fee accumulation, maturity and cooldown gates,
    /// token and stake policy, and the coinbase mint cap. Returns the
    /// spent UTXOs per non-coinbase transaction and the minted amount.
    pub(crate) fn validate_stateful(
        &self,
        utxos: &UtxoSet,
        block: &Block,
        supply_before: u64,
    ) -> Result<(Vec<Vec<Utxo>>, u64), ChainError> {
        let tx_policy = self.params.tx_policy();
        let mut all_spent = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        let mut total_fees: u64 = 0;

        for tx in block.transactions.iter().skip(1) {
            let validated = validate_with_utxos(tx, utxos, &tx_policy)?;
            for utxo in &validated.spent {
                if utxo.is_coinbase
                    && block.header.height.saturating_sub(utxo.height)
                        < self.params.coinbase_maturity
                {
                    return Err(ChainError::CoinbaseNotMature);
                }
                if utxo.locked_until > 0 && block.header.height < utxo.locked_until {
                    return Err(ChainError::OutputLocked {
                        unlock_height: utxo.locked_until,
                    });
                }
            }
            check_token_rules(tx, &validated.spent, validated.fee, self.params.token_creation_fee)?;
            check_stake_outputs(tx, self.params.validator_stake)?;
            total_fees = total_fees
                .checked_add(validated.fee)
                .ok_or(TxValidationError::ValueOverflow)
                .map_err(ChainError::Tx)?;
            all_spent.push(validated.spent);
        }

        let coinbase_total = block.transactions[0]
            .total_output()
            .ok_or(TxValidationError::ValueOverflow)
            .map_err(ChainError::Tx)?;
        // fees are recycled, not newly minted
        let minted = coinbase_total.saturating_sub(total_fees);
        if minted > self.params.block_reward {
            return Err(ChainError::CoinbaseRewardExceeded);
        }
        if self.params.max_supply > 0 {
            let headroom = self.params.max_supply.saturating_sub(supply_before);
            if minted > headroom {
                return Err(ChainError::CoinbaseRewardExceeded);
            }
        }
        Ok((all_spent, minted))
    }

    /// Load the spent UTXOs of already-committed history without
    /// re-validating, and compute the minted amount clamped to the supply
    /// headroom. Used by the rebuild paths.
    pub(crate) fn gather_unchecked(
        &self,
        utxos: &UtxoSet,
        block: &Block,
        supply_before: u64,
    ) -> Result<(Vec<Vec<Utxo>>, u64), ChainError> {
        let mut all_spent = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        let mut total_fees: u64 = 0;
        for tx in block.transactions.iter().skip(1) {
            let mut spent = Vec::with_capacity(tx.inputs.len());
            let mut input_total: u64 = 0;
            for input in &tx.inputs {
                let utxo = utxos.get(&input.prev_out)?.ok_or_else(|| {
                    ChainError::Corrupt(format!(
                        "committed block spends missing UTXO {}",
                        input.prev_out
                    ))
                })?;
                input_total = input_total
                    .checked_add(utxo.value)
                    .ok_or(ChainError::SupplyOverflow)?;
                spent.push(utxo);
            }
            let output_total = tx
                .total_output()
                .ok_or_else(|| ChainError::Corrupt("output overflow in history".to_string()))?;
            let fee = input_total.checked_sub(output_total).ok_or_else(|| {
                ChainError::Corrupt("committed transaction outputs exceed inputs".to_string())
            })?;
            total_fees = total_fees
                .checked_add(fee)
                .ok_or(ChainError::SupplyOverflow)?;
            all_spent.push(spent);
        }
        let coinbase_total = block.transactions[0]
            .total_output()
            .ok_or_else(|| ChainError::Corrupt("coinbase overflow in history".to_string()))?;
        let mut minted = coinbase_total.saturating_sub(total_fees);
        if self.params.max_supply > 0 {
            minted = minted.min(self.params.max_supply.saturating_sub(supply_before));
        }
        Ok((all_spent, minted))
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }
}

/// Apply one block's UTXO delta, collecting the undo record and the
/// handler events (registrations, then stakes, then unstakes).
pub(crate) fn apply_block(
    utxos: &UtxoSet,
    params: &ChainParams,
    block: &Block,
    spent: &[Vec<Utxo>],
    minted: u64,
) -> Result<(UndoRecord, Vec<ChainEvent>), ChainError> {
    let mut undo = UndoRecord {
        block_reward: minted,
        ..UndoRecord::default()
    };
    let mut registers = Vec::new();
    let mut stakes = Vec::new();
    let mut unstakes = Vec::new();
    let height = block.header.height;

    for (index, tx) in block.transactions.iter().enumerate() {
        let tx_hash = tx.hash();
        undo.tx_hashes.push(tx_hash);

        let tx_spent: &[Utxo] = if index == 0 { &[] } else { &spent[index - 1] };
        // spending a stake bond puts the change under the unstake cooldown
        let unstaking = tx_spent
            .iter()
            .any(|utxo| utxo.script.script_type == ScriptType::Stake);
        let locked_until = if unstaking {
            height + params.unstake_cooldown
        } else {
            0
        };

        if index > 0 {
            for input in &tx.inputs {
                let removed = utxos.delete(&input.prev_out)?.ok_or_else(|| {
                    ChainError::ApplyUtxo(format!("missing UTXO {}", input.prev_out))
                })?;
                if removed.script.script_type == ScriptType::Stake {
                    unstakes.push(ChainEvent::Unstaked(removed.clone()));
                }
                undo.spent_utxos.push(removed);
            }
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx_hash, vout as u32);
            let utxo = Utxo {
                outpoint,
                value: output.value,
                script: output.script.clone(),
                token: output.token,
                height,
                is_coinbase: index == 0,
                locked_until: if output.script.script_type == ScriptType::P2pkh {
                    locked_until
                } else {
                    0
                },
            };
            utxos.put(&utxo)?;
            undo.created_outpoints.push(outpoint);
            match output.script.script_type {
                ScriptType::Register => registers.push(ChainEvent::Registered {
                    output: output.clone(),
                    tx_hash,
                    height,
                }),
                ScriptType::Stake => stakes.push(ChainEvent::Staked(utxo)),
                _ => {}
            }
        }
    }

    let mut events = registers;
    events.extend(stakes);
    events.extend(unstakes);
    Ok((undo, events))
}

pub(crate) fn next_state(
    state: &ChainState,
    block: &Block,
    minted: u64,
) -> Result<ChainState, ChainError> {
    Ok(ChainState {
        tip_hash: block.hash(),
        height: block.header.height,
        supply: state
            .supply
            .checked_add(minted)
            .ok_or(ChainError::SupplyOverflow)?,
        cumulative_difficulty: state
            .cumulative_difficulty
            .checked_add(block.header.difficulty)
            .ok_or_else(|| ChainError::Corrupt("cumulative difficulty overflow".to_string()))?,
        tip_timestamp: block.header.timestamp,
    })
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
