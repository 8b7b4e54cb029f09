//! Shared fixtures for unit and integration tests: deterministic keys, a
//! small network harness, and block/transaction builders that produce
//! consensus-valid artifacts.

use std::sync::Arc;

use crate::chain::{Chain, ChainParams, EventSink, GenesisConfig, NullSink};
use crate::consensus::poa::{PoaEngine, DIFF_IN_TURN, DIFF_NO_TURN};
use crate::crypto::hash::pubkey_to_address;
use crate::crypto::signature::Keypair;
use crate::types::block::{Block, BlockHeader};
use crate::types::transaction::{Script, Transaction, TxInput, TxOutput};
use crate::types::{Address, OutPoint, BLOCK_VERSION};

/// Deterministic keypair from a small seed. Seeds must be non-zero.
pub fn test_keypair(seed: u8) -> Keypair {
    assert!(seed != 0, "seed 0 is not a valid secret key");
    Keypair::from_secret_bytes(&[seed; 32]).expect("small constant seeds are valid scalars")
}

pub fn p2pkh_output(value: u64, address: &Address) -> TxOutput {
    TxOutput {
        value,
        script: Script::pay_to_address(address),
        token: None,
    }
}

pub fn stake_output(value: u64, pubkey: &[u8; 33]) -> TxOutput {
    TxOutput {
        value,
        script: Script::stake(pubkey),
        token: None,
    }
}

/// Build and sign a transaction spending the given outpoints, each owned
/// by the paired key.
pub fn signed_tx(inputs: Vec<(OutPoint, &Keypair)>, outputs: Vec<TxOutput>) -> Transaction {
    let mut tx = Transaction::new(
        inputs
            .iter()
            .map(|(outpoint, key)| TxInput {
                prev_out: *outpoint,
                signature: vec![0u8; 64],
                pubkey: key.public_key().to_vec(),
            })
            .collect(),
        outputs,
    );
    let msg = tx.hash();
    for (index, (_, key)) in inputs.iter().enumerate() {
        tx.inputs[index].signature = key.sign(&msg).to_vec();
    }
    tx
}

/// A single-process validator network over one sled database.
pub struct TestNet {
    /// Validator keys, aligned with the engine's canonical order
    pub keys: Vec<Keypair>,
    pub poa: Arc<PoaEngine>,
    pub chain: Chain,
    pub genesis: Block,
}

impl TestNet {
    /// Chain with `validator_count` validators (block time 1 s) and the
    /// given genesis grants, applied and ready.
    pub fn new(
        db: &sled::Db,
        validator_count: usize,
        params: ChainParams,
        genesis_config: &GenesisConfig,
    ) -> Self {
        Self::with_sink(db, validator_count, params, genesis_config, Arc::new(NullSink))
    }

    pub fn with_sink(
        db: &sled::Db,
        validator_count: usize,
        params: ChainParams,
        genesis_config: &GenesisConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mut keys: Vec<Keypair> = (0..validator_count)
            .map(|i| test_keypair(i as u8 + 1))
            .collect();
        // canonical (lexicographic) order so keys[i] matches validators()[i]
        keys.sort_by_key(|k| k.public_key());
        let validators = keys.iter().map(|k| k.public_key()).collect();
        let poa = Arc::new(PoaEngine::new(validators, 1).expect("engine"));

        let chain = Chain::with_db(db, params, Arc::clone(&poa), sink).expect("open chain");
        let genesis = crate::chain::build_genesis(genesis_config);
        chain.init_from_genesis(&genesis).expect("apply genesis");
        Self {
            keys,
            poa,
            chain,
            genesis,
        }
    }

    /// Reopen the chain over the same database (fresh in-memory state),
    /// e.g. to exercise startup recovery.
    pub fn reopen(&self, db: &sled::Db) -> Chain {
        let params = self.chain.params().clone();
        Chain::with_db(db, params, Arc::clone(&self.poa), Arc::new(NullSink))
            .expect("reopen chain")
    }

    /// Address paid by `keys[index]`-owned outputs.
    pub fn address(&self, index: usize) -> Address {
        pubkey_to_address(&self.keys[index].public_key())
    }

    /// Earliest timestamp >= `from` whose slot belongs to `keys[index]`.
    pub fn slot_for(&self, index: usize, from: u64) -> u64 {
        let target = self.keys[index].public_key();
        let mut ts = from;
        loop {
            if self.poa.slot_validator(ts).expect("slot") == target {
                return ts;
            }
            ts += self.poa.block_time();
        }
    }

    /// Earliest timestamp >= `from` whose slot does NOT belong to
    /// `keys[index]`.
    pub fn off_slot_for(&self, index: usize, from: u64) -> u64 {
        let target = self.keys[index].public_key();
        let mut ts = from;
        loop {
            if self.poa.slot_validator(ts).expect("slot") != target {
                return ts;
            }
            ts += self.poa.block_time();
        }
    }

    /// Build a sealed block by `keys[signer]` with the correct weighted
    /// difficulty for its slot relation.
    pub fn build_block(
        &self,
        signer: usize,
        prev_hash: crate::types::Hash,
        height: u64,
        timestamp: u64,
        coinbase_outputs: Vec<TxOutput>,
        mut txs: Vec<Transaction>,
    ) -> Block {
        let signer_key = &self.keys[signer];
        let difficulty = if self.poa.slot_validator(timestamp).expect("slot")
            == signer_key.public_key()
        {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        };

        txs.sort_by_key(|tx| tx.hash());
        let mut transactions = vec![Transaction::coinbase(height, coinbase_outputs)];
        transactions.extend(txs);

        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash,
                merkle_root: crate::types::ZERO_HASH,
                timestamp,
                height,
                difficulty,
                nonce: 0,
                validator_sig: Vec::new(),
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        block.header.validator_sig = signer_key.sign(&block.header.hash()).to_vec();
        block
    }

    /// Build and apply the next block on the current tip, coinbase paid to
    /// `keys[signer]`, at the next slot owned by that signer.
    pub fn mine(
        &self,
        signer: usize,
        coinbase_value: u64,
        txs: Vec<Transaction>,
    ) -> Result<Block, crate::chain::ChainError> {
        let state = self.chain.state()?;
        let timestamp = self.slot_for(signer, state.tip_timestamp + 1);
        let block = self.build_block(
            signer,
            state.tip_hash,
            state.height + 1,
            timestamp,
            vec![p2pkh_output(coinbase_value, &self.address(signer))],
            txs,
        );
        self.chain.process_block(&block)?;
        Ok(block)
    }
}
