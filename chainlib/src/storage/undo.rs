use serde::{Deserialize, Serialize};

use crate::storage::utxo_set::Utxo;
use crate::types::{Hash, OutPoint};

/// Per-block undo log. Captures the exact UTXO-set delta of one applied
/// block so the block can be reversed deterministically during a reorg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    /// UTXOs consumed by the block, in spend order, with full pre-spend state
    pub spent_utxos: Vec<Utxo>,
    /// Outpoints created by the block, in creation order
    pub created_outpoints: Vec<OutPoint>,
    /// Hashes of every transaction in the block, coinbase first
    pub tx_hashes: Vec<Hash>,
    /// Newly minted amount added to supply by this block (after fee
    /// recycling and the supply-cap clamp); revert subtracts exactly this
    pub block_reward: u64,
}
