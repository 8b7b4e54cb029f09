//! Structural block validation: everything that can be checked without
//! touching the UTXO set.

use std::collections::HashSet;

use thiserror::Error;

use crate::types::block::Block;
use crate::types::BLOCK_VERSION;
use crate::validation::transaction::{check_transaction, TxPolicy, TxValidationError};

#[derive(Debug, Error)]
pub enum BlockValidationError {
    #[error("unsupported block version {0}")]
    BadVersion(u32),

    #[error("block of {size} bytes exceeds limit {max}")]
    BlockTooLarge { size: usize, max: usize },

    #[error("too many transactions: {count} > {max}")]
    TooManyTxs { count: usize, max: usize },

    #[error("first transaction is not a well-formed coinbase")]
    NoCoinbase,

    #[error("coinbase input outside the first transaction")]
    MultipleCoinbase,

    #[error("coinbase output carries a mint script or token data")]
    CoinbaseMintOutput,

    #[error("transactions are not in canonical hash order")]
    BadTxOrder,

    #[error("duplicate outpoint spent across the block")]
    DuplicateOutpoint,

    #[error("merkle root does not match transactions")]
    BadMerkleRoot,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error(transparent)]
    Tx(#[from] TxValidationError),
}

/// Structural bounds applied to every block.
#[derive(Debug, Clone, Copy)]
pub struct BlockPolicy {
    pub max_block_size: usize,
    pub max_block_txs: usize,
    pub tx_policy: TxPolicy,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            max_block_size: 1_000_000,
            max_block_txs: 4_096,
            tx_policy: TxPolicy::default(),
        }
    }
}

/// Validate block structure: version, size and count bounds, exactly one
/// coinbase in position 0, no other coinbase input, canonical transaction
/// order, no outpoint spent twice, merkle root, and per-transaction
/// structural rules.
pub fn check_block_structure(
    block: &Block,
    policy: &BlockPolicy,
) -> Result<(), BlockValidationError> {
    if block.header.version != BLOCK_VERSION {
        return Err(BlockValidationError::BadVersion(block.header.version));
    }
    if block.transactions.is_empty() {
        return Err(BlockValidationError::NoCoinbase);
    }
    if block.transactions.len() > policy.max_block_txs {
        return Err(BlockValidationError::TooManyTxs {
            count: block.transactions.len(),
            max: policy.max_block_txs,
        });
    }

    let size = bincode::serialized_size(block)? as usize;
    if size > policy.max_block_size {
        return Err(BlockValidationError::BlockTooLarge {
            size,
            max: policy.max_block_size,
        });
    }

    let coinbase = &block.transactions[0];
    if !coinbase.is_coinbase() {
        return Err(BlockValidationError::NoCoinbase);
    }
    for output in &coinbase.outputs {
        if output.script.script_type == crate::types::transaction::ScriptType::Mint
            || output.token.is_some()
        {
            return Err(BlockValidationError::CoinbaseMintOutput);
        }
    }

    let mut seen = HashSet::new();
    for tx in block.transactions.iter().skip(1) {
        for input in &tx.inputs {
            if input.is_coinbase() {
                return Err(BlockValidationError::MultipleCoinbase);
            }
            if !seen.insert(input.prev_out) {
                return Err(BlockValidationError::DuplicateOutpoint);
            }
        }
    }

    if !block.has_canonical_order() {
        return Err(BlockValidationError::BadTxOrder);
    }

    if block.compute_merkle_root() != block.header.merkle_root {
        return Err(BlockValidationError::BadMerkleRoot);
    }

    for tx in &block.transactions {
        check_transaction(tx, &policy.tx_policy)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::block::BlockHeader;
    use crate::types::transaction::{Script, TokenData, Transaction, TxInput, TxOutput};
    use crate::types::{OutPoint, ZERO_HASH};

    fn spend(txid: u8, value: u64) -> Transaction {
        Transaction::new(
            vec![TxInput {
                prev_out: OutPoint::new([txid; 32], 0),
                signature: vec![0xab; 64],
                pubkey: vec![0x02; 33],
            }],
            vec![TxOutput {
                value,
                script: Script::pay_to_address(&[txid; 20]),
                token: None,
            }],
        )
    }

    fn build_block(mut txs: Vec<Transaction>) -> Block {
        let coinbase = Transaction::coinbase(
            1,
            vec![TxOutput {
                value: 50,
                script: Script::pay_to_address(&[0u8; 20]),
                token: None,
            }],
        );
        txs.sort_by_key(|tx| tx.hash());
        let mut transactions = vec![coinbase];
        transactions.extend(txs);
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_hash: [1u8; 32],
                merkle_root: ZERO_HASH,
                timestamp: 1_700_000_000,
                height: 1,
                difficulty: 2,
                nonce: 0,
                validator_sig: Vec::new(),
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    #[test]
    fn valid_block_passes() {
        let block = build_block(vec![spend(1, 10), spend(2, 20)]);
        check_block_structure(&block, &BlockPolicy::default()).expect("valid");
    }

    #[test]
    fn merkle_mismatch_rejected() {
        let mut block = build_block(vec![spend(1, 10)]);
        block.header.merkle_root = [0xee; 32];
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::BadMerkleRoot)
        ));
    }

    #[test]
    fn order_violation_rejected() {
        let mut block = build_block(vec![spend(1, 10), spend(2, 20), spend(3, 30)]);
        block.transactions.swap(1, 3);
        block.header.merkle_root = block.compute_merkle_root();
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::BadTxOrder)
        ));
    }

    #[test]
    fn second_coinbase_rejected() {
        let mut block = build_block(vec![spend(1, 10)]);
        block.transactions.push(Transaction::coinbase(
            2,
            vec![TxOutput {
                value: 1,
                script: Script::pay_to_address(&[1u8; 20]),
                token: None,
            }],
        ));
        block.header.merkle_root = block.compute_merkle_root();
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::MultipleCoinbase)
        ));
    }

    #[test]
    fn missing_coinbase_rejected() {
        let mut block = build_block(vec![]);
        block.transactions[0] = spend(1, 10);
        block.header.merkle_root = block.compute_merkle_root();
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::NoCoinbase)
        ));
    }

    #[test]
    fn cross_tx_double_spend_rejected() {
        // two transactions spending the same outpoint
        let a = spend(1, 10);
        let mut b = spend(1, 20);
        b.outputs[0].value = 20;
        let mut block = build_block(vec![a, b]);
        block.header.merkle_root = block.compute_merkle_root();
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::DuplicateOutpoint)
        ));
    }

    #[test]
    fn coinbase_token_payload_rejected() {
        let mut block = build_block(vec![]);
        block.transactions[0].outputs[0].token = Some(TokenData {
            id: [1u8; 32],
            amount: 5,
        });
        block.header.merkle_root = block.compute_merkle_root();
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::CoinbaseMintOutput)
        ));
    }

    #[test]
    fn oversize_block_rejected() {
        let block = build_block(vec![spend(1, 10)]);
        let policy = BlockPolicy {
            max_block_size: 64,
            ..BlockPolicy::default()
        };
        assert!(matches!(
            check_block_structure(&block, &policy),
            Err(BlockValidationError::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut block = build_block(vec![]);
        block.header.version = 9;
        assert!(matches!(
            check_block_structure(&block, &BlockPolicy::default()),
            Err(BlockValidationError::BadVersion(9))
        ));
    }
}
