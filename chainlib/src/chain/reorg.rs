//! Chain reorganization: branch collection, cumulative-difficulty
//! comparison, undo-based revert with validated replay, and the rebuild
//! fallback that reconstructs the UTXO set from genesis.

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use crate::chain::events::ChainEvent;
use crate::chain::{apply_block, next_state, Chain, ChainError, ChainInner, ChainState};
use crate::storage::Utxo;
use crate::types::block::Block;
use crate::types::transaction::{ScriptType, Transaction};
use crate::types::{Hash, OutPoint};

impl Chain {
    /// Attempt to switch the active chain to the branch ending at
    /// `candidate`. Returns `Ok(None)` (state untouched) when the branch
    /// does not strictly outweigh the current chain.
    pub(crate) fn reorg(
        &self,
        inner: &mut ChainInner,
        candidate: Hash,
    ) -> Result<Option<Vec<ChainEvent>>, ChainError> {
        let branch = self.collect_branch(inner, candidate)?;
        let branch = match branch {
            Some(branch) => branch,
            None => return Ok(None),
        };
        let fork_height = branch[0].header.height - 1;

        let new_work = branch_work(&branch)?;
        let mut old_work: u64 = 0;
        for height in fork_height + 1..=inner.state.height {
            let block = inner.store.get_block_by_height(height)?.ok_or_else(|| {
                ChainError::Corrupt(format!("height index missing block at {height}"))
            })?;
            old_work = old_work
                .checked_add(block.header.difficulty)
                .ok_or_else(|| ChainError::Corrupt("difficulty overflow".to_string()))?;
        }
        // equal work keeps the current chain; no flip-flopping
        if new_work <= old_work {
            debug!(new_work, old_work, fork_height, "branch does not outweigh active chain");
            return Ok(None);
        }

        info!(
            fork_height,
            new_work,
            old_work,
            depth = inner.state.height - fork_height,
            candidate = %hex::encode(candidate),
            "reorganizing"
        );
        inner.store.put_reorg_checkpoint(fork_height)?;

        let mut events = Vec::new();
        let mut reverted_txs: Vec<Transaction> = Vec::new();
        let mut supply = inner.state.supply;
        let mut cumulative_difficulty = inner.state.cumulative_difficulty;

        // revert the losing branch, tip first
        for height in (fork_height + 1..=inner.state.height).rev() {
            let block = inner.store.get_block_by_height(height)?.ok_or_else(|| {
                ChainError::Corrupt(format!("height index missing block at {height}"))
            })?;
            let block_hash = block.hash();
            let undo = match inner.store.get_undo(&block_hash)? {
                Some(undo) => undo,
                None => {
                    // self-healing path: replay everything from genesis
                    warn!(height, "undo record missing; falling back to rebuild");
                    return self.rebuild_reorg(inner, &branch, fork_height).map(Some);
                }
            };

            for outpoint in undo.created_outpoints.iter().rev() {
                if inner.utxos.delete(outpoint)?.is_none() {
                    return Err(ChainError::Corrupt(format!(
                        "undo lists unknown created outpoint {outpoint}"
                    )));
                }
            }
            for utxo in &undo.spent_utxos {
                inner.utxos.put(utxo)?;
            }
            for tx_hash in &undo.tx_hashes {
                inner.store.delete_tx_index(tx_hash)?;
            }

            events.push(ChainEvent::BlockReverted(block.clone()));
            events.extend(revert_events(&block, &undo.spent_utxos));

            reverted_txs.extend(block.transactions.iter().skip(1).cloned());
            supply = supply
                .checked_sub(undo.block_reward)
                .ok_or(ChainError::SupplyUnderflow)?;
            cumulative_difficulty = cumulative_difficulty
                .checked_sub(block.header.difficulty)
                .ok_or_else(|| {
                    ChainError::Corrupt("cumulative difficulty underflow".to_string())
                })?;

            inner.store.delete_undo(&block_hash)?;
            inner.store.delete_height(height)?;
        }

        // replay the winning branch with full validation
        let ancestor = inner.store.get_block_by_height(fork_height)?.ok_or_else(|| {
            ChainError::Corrupt(format!("common ancestor missing at {fork_height}"))
        })?;
        let mut state = ChainState {
            tip_hash: ancestor.hash(),
            height: fork_height,
            supply,
            cumulative_difficulty,
            tip_timestamp: ancestor.header.timestamp,
        };

        for block in &branch {
            match self.replay_one(inner, &mut state, block) {
                Ok(block_events) => events.extend(block_events),
                Err(err) => {
                    // the branch won on work but fails full validation;
                    // restore a consistent state before propagating
                    error!(height = block.header.height, %err, "replay failed; rebuilding");
                    if let Err(recover_err) = self.recover_checkpoint(inner) {
                        error!(%recover_err, "recovery after failed replay also failed");
                    }
                    return Err(err);
                }
            }
        }

        inner.state = state;
        inner.store.clear_reorg_checkpoint()?;

        let replayed: HashSet<Hash> = branch
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.hash()))
            .collect();
        let returned: Vec<Transaction> = reverted_txs
            .into_iter()
            .filter(|tx| !replayed.contains(&tx.hash()))
            .collect();
        if !returned.is_empty() {
            events.push(ChainEvent::RevertedTxs(returned));
        }

        info!(
            height = inner.state.height,
            tip = %hex::encode(inner.state.tip_hash),
            "reorganization complete"
        );
        Ok(Some(events))
    }

    /// Walk parent hashes from `candidate` until a block indexed at its
    /// own height (the common ancestor). Returns the branch above the
    /// ancestor in ascending height order.
    fn collect_branch(
        &self,
        inner: &ChainInner,
        candidate: Hash,
    ) -> Result<Option<Vec<Block>>, ChainError> {
        let mut branch: Vec<Block> = Vec::new();
        let mut cursor = candidate;
        loop {
            let block = inner
                .store
                .get_block(&cursor)?
                .ok_or(ChainError::PrevNotFound)?;
            if inner.store.get_hash_by_height(block.header.height)? == Some(cursor) {
                // common ancestor; not part of the branch
                break;
            }
            if block.header.height == 0 {
                return Err(ChainError::GenesisReorg);
            }
            if branch.len() as u64 >= self.params().max_reorg_depth {
                return Err(ChainError::ReorgTooDeep {
                    depth: branch.len() as u64 + 1,
                    max: self.params().max_reorg_depth,
                });
            }
            cursor = block.header.prev_hash;
            branch.push(block);
        }
        if branch.is_empty() {
            return Ok(None);
        }
        branch.reverse();
        Ok(Some(branch))
    }

    /// Fully validate and apply one replayed block, committing block,
    /// indexes, undo, and state atomically per block.
    fn replay_one(
        &self,
        inner: &mut ChainInner,
        state: &mut ChainState,
        block: &Block,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let expected = state.height + 1;
        if block.header.height != expected {
            return Err(ChainError::BadHeight {
                expected,
                got: block.header.height,
            });
        }
        if block.header.prev_hash != state.tip_hash {
            return Err(ChainError::BadPrevHash);
        }
        self.verify_block_full(&inner.store, block, state.tip_timestamp)?;
        let (spent, minted) = self.validate_stateful(&inner.utxos, block, state.supply)?;
        let (undo, apply_events) =
            apply_block(&inner.utxos, self.params(), block, &spent, minted)?;

        let new_state = next_state(state, block, minted)?;
        inner
            .store
            .commit_block(block, &undo, &new_state.to_stored())?;
        *state = new_state;

        let mut events = vec![ChainEvent::BlockApplied(block.clone())];
        events.extend(apply_events);
        Ok(events)
    }

    /// Rebuild fallback: index the winning branch by height, clear the
    /// UTXO set, and replay every block from genesis, re-validating the
    /// new branch only and repopulating undo records. Slower but
    /// self-healing.
    pub(crate) fn rebuild_reorg(
        &self,
        inner: &mut ChainInner,
        branch: &[Block],
        fork_height: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let old_height = inner.state.height;
        let mut events = Vec::new();
        let mut reverted_txs: Vec<Transaction> = Vec::new();

        // best-effort deregistration/unstake for the abandoned branch
        for height in fork_height + 1..=old_height {
            if let Some(block) = inner.store.get_block_by_height(height)? {
                events.push(ChainEvent::BlockReverted(block.clone()));
                events.extend(revert_events(&block, &[]));
                reverted_txs.extend(block.transactions.iter().skip(1).cloned());
            }
        }

        // the winning branch becomes the height index truth
        for block in branch {
            inner.store.put_block(block)?;
        }
        let new_tip_height = branch
            .last()
            .map(|b| b.header.height)
            .unwrap_or(fork_height);
        for height in new_tip_height + 1..=old_height {
            inner.store.delete_height(height)?;
        }

        let replay_events = self.replay_from_genesis(inner, new_tip_height, fork_height)?;
        events.extend(replay_events);

        let replayed: HashSet<Hash> = branch
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.hash()))
            .collect();
        let returned: Vec<Transaction> = reverted_txs
            .into_iter()
            .filter(|tx| !replayed.contains(&tx.hash()))
            .collect();
        if !returned.is_empty() {
            events.push(ChainEvent::RevertedTxs(returned));
        }

        inner.store.clear_reorg_checkpoint()?;
        info!(height = inner.state.height, "rebuild complete");
        Ok(events)
    }

    /// Replay heights 0..=`tip_height` onto a cleared UTXO set. Blocks at
    /// or below `validate_above` are committed history and are applied
    /// without consensus re-validation; blocks above it are fully
    /// validated and their handler events collected. Undo records, supply,
    /// and cumulative difficulty are recomputed from scratch.
    fn replay_from_genesis(
        &self,
        inner: &mut ChainInner,
        tip_height: u64,
        validate_above: u64,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        inner.utxos.clear_all()?;

        let genesis = inner
            .store
            .get_block_by_height(0)?
            .ok_or_else(|| ChainError::Corrupt("genesis missing from height index".to_string()))?;
        let mut supply: u64 = 0;
        for tx in &genesis.transactions {
            let tx_hash = tx.hash();
            for (vout, output) in tx.outputs.iter().enumerate() {
                inner.utxos.put(&Utxo {
                    outpoint: OutPoint::new(tx_hash, vout as u32),
                    value: output.value,
                    script: output.script.clone(),
                    token: output.token,
                    height: 0,
                    is_coinbase: false,
                    locked_until: 0,
                })?;
                supply = supply
                    .checked_add(output.value)
                    .ok_or(ChainError::SupplyOverflow)?;
            }
        }
        let mut state = ChainState {
            tip_hash: genesis.hash(),
            height: 0,
            supply,
            cumulative_difficulty: genesis.header.difficulty,
            tip_timestamp: genesis.header.timestamp,
        };

        let mut events = Vec::new();
        for height in 1..=tip_height {
            let block = inner.store.get_block_by_height(height)?.ok_or_else(|| {
                ChainError::Corrupt(format!("height index missing block at {height}"))
            })?;
            if block.header.prev_hash != state.tip_hash {
                return Err(ChainError::Corrupt(format!(
                    "height index breaks parent linkage at {height}"
                )));
            }

            let validate = height > validate_above;
            let (spent, minted) = if validate {
                self.verify_block_full(&inner.store, &block, state.tip_timestamp)?;
                self.validate_stateful(&inner.utxos, &block, state.supply)?
            } else {
                self.gather_unchecked(&inner.utxos, &block, state.supply)?
            };
            let (undo, apply_events) =
                apply_block(&inner.utxos, self.params(), &block, &spent, minted)?;

            let new_state = next_state(&state, &block, minted)?;
            inner.store.put_undo(&block.hash(), &undo)?;
            inner.store.put_state(&new_state.to_stored())?;
            state = new_state;

            if validate {
                events.push(ChainEvent::BlockApplied(block.clone()));
                events.extend(apply_events);
            }
        }

        inner.store.flush()?;
        inner.state = state;
        Ok(events)
    }

    /// Startup crash recovery. If a reorg checkpoint survived a crash, the
    /// height index is healed by re-indexing the chain walked down from the
    /// highest entry, stale tx-location entries are purged, and the UTXO
    /// set is rebuilt by a full replay before the chain accepts blocks.
    pub(crate) fn recover_checkpoint(&self, inner: &mut ChainInner) -> Result<(), ChainError> {
        let fork_height = match inner.store.get_reorg_checkpoint()? {
            Some(height) => height,
            None => return Ok(()),
        };
        warn!(fork_height, "reorg checkpoint present at startup; rebuilding state");

        let top_height = inner.store.max_indexed_height()?.ok_or_else(|| {
            ChainError::Corrupt("reorg checkpoint present but height index empty".to_string())
        })?;
        let mut cursor = inner.store.get_hash_by_height(top_height)?.ok_or_else(|| {
            ChainError::Corrupt("height index lost its top entry".to_string())
        })?;

        // heal mixed-branch height entries by walking parents from the top
        let mut active: HashSet<Hash> = HashSet::new();
        let mut height = top_height;
        loop {
            let block = inner.store.get_block(&cursor)?.ok_or_else(|| {
                ChainError::Corrupt(format!("chain walk hit missing block {}", hex::encode(cursor)))
            })?;
            if block.header.height != height {
                return Err(ChainError::Corrupt(format!(
                    "block {} stored at height {} claims height {}",
                    hex::encode(cursor),
                    height,
                    block.header.height
                )));
            }
            inner.store.put_block(&block)?;
            active.insert(cursor);
            if height == 0 {
                break;
            }
            cursor = block.header.prev_hash;
            height -= 1;
        }
        inner.store.retain_tx_index(|hash| active.contains(hash))?;

        self.replay_from_genesis(inner, top_height, u64::MAX)?;
        inner.genesis_hash = inner.store.get_hash_by_height(0)?.ok_or_else(|| {
            ChainError::Corrupt("genesis missing after rebuild".to_string())
        })?;
        inner.store.clear_reorg_checkpoint()?;
        info!(height = inner.state.height, "crash recovery complete");
        Ok(())
    }
}

/// Handler events for one reverted block: deregistrations, unstakes for
/// removed stake outputs, stakes for restored stake UTXOs.
fn revert_events(block: &Block, restored: &[Utxo]) -> Vec<ChainEvent> {
    let height = block.header.height;
    let mut events = Vec::new();
    for tx in &block.transactions {
        let tx_hash = tx.hash();
        for (vout, output) in tx.outputs.iter().enumerate() {
            match output.script.script_type {
                ScriptType::Register => events.push(ChainEvent::Deregistered {
                    output: output.clone(),
                    tx_hash,
                    height,
                }),
                ScriptType::Stake => events.push(ChainEvent::Unstaked(Utxo {
                    outpoint: OutPoint::new(tx_hash, vout as u32),
                    value: output.value,
                    script: output.script.clone(),
                    token: output.token,
                    height,
                    is_coinbase: false,
                    locked_until: 0,
                })),
                _ => {}
            }
        }
    }
    for utxo in restored {
        if utxo.script.script_type == ScriptType::Stake {
            events.push(ChainEvent::Staked(utxo.clone()));
        }
    }
    events
}

fn branch_work(branch: &[Block]) -> Result<u64, ChainError> {
    branch
        .iter()
        .try_fold(0u64, |acc, block| acc.checked_add(block.header.difficulty))
        .ok_or_else(|| ChainError::Corrupt("difficulty overflow".to_string()))
}
