//! Chain observer wiring. The chain emits events after each commit; this
//! sink feeds the mempool (drain confirmed, readmit reorged) and keeps the
//! PoA validator set aligned with on-chain stake bonds. Runs on the chain
//! caller's thread and never re-enters the chain.

use std::sync::Arc;

use tracing::{debug, info, warn};

use chainlib::chain::EventSink;
use chainlib::consensus::PoaEngine;
use chainlib::crypto::signature::PUBKEY_LEN;
use chainlib::mempool::Mempool;
use chainlib::storage::{Utxo, UtxoSet};
use chainlib::types::{Block, Transaction};

pub struct NodeSink {
    pool: Arc<Mempool>,
    poa: Arc<PoaEngine>,
    utxos: Arc<UtxoSet>,
}

impl NodeSink {
    pub fn new(pool: Arc<Mempool>, poa: Arc<PoaEngine>, utxos: Arc<UtxoSet>) -> Self {
        Self { pool, poa, utxos }
    }

    fn staked_pubkey(utxo: &Utxo) -> Option<[u8; PUBKEY_LEN]> {
        if utxo.script.data.len() != PUBKEY_LEN {
            return None;
        }
        let mut pubkey = [0u8; PUBKEY_LEN];
        pubkey.copy_from_slice(&utxo.script.data);
        Some(pubkey)
    }
}

impl EventSink for NodeSink {
    fn on_block_applied(&self, block: &Block) {
        if let Err(err) = self.pool.remove_confirmed(&block.transactions[1..]) {
            warn!(%err, "failed to drop confirmed transactions from mempool");
        }
    }

    fn on_stake(&self, utxo: &Utxo) {
        // stake-backed admission: a bonded key may sign blocks, subject to
        // the engine's stake check at verification time
        if let Some(pubkey) = Self::staked_pubkey(utxo) {
            match self.poa.add_validator(pubkey) {
                Ok(true) => info!(pubkey = %hex::encode(pubkey), "validator admitted on stake"),
                Ok(false) => {}
                Err(err) => warn!(%err, "validator admission failed"),
            }
        }
    }

    fn on_unstake(&self, utxo: &Utxo) {
        // drop a validator once its last bond is gone; genesis validators
        // are irremovable by the engine
        let pubkey = match Self::staked_pubkey(utxo) {
            Some(pubkey) => pubkey,
            None => return,
        };
        match self.utxos.get_stakes(&pubkey) {
            Ok(stakes) if stakes.is_empty() => match self.poa.remove_validator(&pubkey) {
                Ok(true) => info!(pubkey = %hex::encode(pubkey), "validator removed on unstake"),
                Ok(false) => {}
                Err(err) => warn!(%err, "validator removal failed"),
            },
            Ok(_) => {}
            Err(err) => warn!(%err, "stake lookup failed during unstake"),
        }
    }

    fn on_reverted_txs(&self, txs: &[Transaction]) {
        for tx in txs {
            // best effort: the transaction may have become invalid or
            // under-priced on the new branch
            match self.pool.add(tx.clone()) {
                Ok(_) => debug!(hash = %hex::encode(tx.hash()), "reverted transaction readmitted"),
                Err(err) => debug!(hash = %hex::encode(tx.hash()), %err, "reverted transaction dropped"),
            }
        }
    }
}
