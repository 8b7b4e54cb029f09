//! Observer seam between the chain and its surroundings. The chain never
//! imports the mempool or registry; it emits events through this trait
//! after each commit, on the caller's thread, outside the chain lock.
//! Implementations must not re-enter the chain.

use crate::storage::Utxo;
use crate::types::block::Block;
use crate::types::transaction::{Transaction, TxOutput};
use crate::types::Hash;

/// Ordered record of one state change, dispatched to the [`EventSink`].
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockApplied(Block),
    BlockReverted(Block),
    Registered {
        output: TxOutput,
        tx_hash: Hash,
        height: u64,
    },
    Deregistered {
        output: TxOutput,
        tx_hash: Hash,
        height: u64,
    },
    Staked(Utxo),
    Unstaked(Utxo),
    RevertedTxs(Vec<Transaction>),
}

/// Chain observer. All methods default to no-ops so implementations pick
/// what they care about.
pub trait EventSink: Send + Sync {
    /// A block was committed to the active chain.
    fn on_block_applied(&self, _block: &Block) {}

    /// A block was removed from the active chain during a reorg.
    fn on_block_reverted(&self, _block: &Block) {}

    /// A Register output entered the active chain.
    fn on_register(&self, _output: &TxOutput, _tx_hash: &Hash, _height: u64) {}

    /// A Register output left the active chain.
    fn on_deregister(&self, _output: &TxOutput, _tx_hash: &Hash, _height: u64) {}

    /// A stake UTXO was created (or restored by a revert).
    fn on_stake(&self, _utxo: &Utxo) {}

    /// A stake UTXO was spent (or removed by a revert).
    fn on_unstake(&self, _utxo: &Utxo) {}

    /// Transactions knocked out of the chain by a reorg and absent from
    /// the winning branch; typically reinserted into the mempool.
    fn on_reverted_txs(&self, _txs: &[Transaction]) {}
}

/// Sink that ignores everything.
pub struct NullSink;

impl EventSink for NullSink {}

pub(crate) fn dispatch(sink: &dyn EventSink, events: &[ChainEvent]) {
    for event in events {
        match event {
            ChainEvent::BlockApplied(block) => sink.on_block_applied(block),
            ChainEvent::BlockReverted(block) => sink.on_block_reverted(block),
            ChainEvent::Registered {
                output,
                tx_hash,
                height,
            } => sink.on_register(output, tx_hash, *height),
            ChainEvent::Deregistered {
                output,
                tx_hash,
                height,
            } => sink.on_deregister(output, tx_hash, *height),
            ChainEvent::Staked(utxo) => sink.on_stake(utxo),
            ChainEvent::Unstaked(utxo) => sink.on_unstake(utxo),
            ChainEvent::RevertedTxs(txs) => sink.on_reverted_txs(txs),
        }
    }
}
