use serde::{Deserialize, Serialize};

use crate::crypto::hash::hash_bytes;
use crate::types::transaction::Transaction;
use crate::types::{Hash, ZERO_HASH};

/// Block header. The signing bytes cover every field except
/// `validator_sig`; the header hash is BLAKE3 over those bytes, so sealing
/// a header does not change its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Version number to track protocol upgrades
    pub version: u32,
    /// Hash of the previous block in the chain
    pub prev_hash: Hash,
    /// Root of the merkle tree over the block's transaction hashes
    pub merkle_root: Hash,
    /// Unix timestamp of block creation, seconds
    pub timestamp: u64,
    /// Height of this block, genesis = 0
    pub height: u64,
    /// Consensus weight assigned by the PoA engine (2 in-turn, 1 backup)
    pub difficulty: u64,
    /// Reserved; always zero under PoA
    pub nonce: u64,
    /// Schnorr signature of the header hash by the producing validator
    pub validator_sig: Vec<u8>,
}

impl BlockHeader {
    /// Canonical bytes covered by the validator signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(100);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.difficulty.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    pub fn hash(&self) -> Hash {
        hash_bytes(&self.signing_bytes())
    }
}

/// A block: header plus transactions. Transaction 0 is the coinbase; the
/// remainder must be sorted ascending by transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.hash()).collect()
    }

    /// Recompute the merkle root over the block's transactions.
    pub fn compute_merkle_root(&self) -> Hash {
        compute_merkle_root(&self.tx_hashes())
    }

    /// Non-coinbase transactions must be strictly increasing by hash.
    pub fn has_canonical_order(&self) -> bool {
        self.transactions
            .iter()
            .skip(1)
            .map(|tx| tx.hash())
            .collect::<Vec<_>>()
            .windows(2)
            .all(|pair| pair[0] < pair[1])
    }
}

/// Binary merkle tree with the last leaf duplicated on odd levels.
/// An empty leaf set yields the zero hash.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                hash_bytes(&buf)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::{Script, Transaction, TxOutput};

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: [1u8; 32],
            merkle_root: [2u8; 32],
            timestamp: 1_700_000_000,
            height: 5,
            difficulty: 2,
            nonce: 0,
            validator_sig: Vec::new(),
        }
    }

    #[test]
    fn header_hash_ignores_signature() {
        let unsigned = header();
        let mut signed = unsigned.clone();
        signed.validator_sig = vec![0xcc; 64];
        assert_eq!(unsigned.hash(), signed.hash());

        let mut other = unsigned.clone();
        other.difficulty = 1;
        assert_ne!(unsigned.hash(), other.hash());
    }

    #[test]
    fn merkle_single_leaf_is_identity() {
        let leaf = [4u8; 32];
        assert_eq!(compute_merkle_root(&[leaf]), leaf);
        assert_eq!(compute_merkle_root(&[]), ZERO_HASH);
    }

    #[test]
    fn merkle_duplicates_last_leaf() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        // three leaves hash as [a b] [c c]
        let root3 = compute_merkle_root(&[a, b, c]);
        let root4 = compute_merkle_root(&[a, b, c, c]);
        assert_eq!(root3, root4);
        assert_ne!(root3, compute_merkle_root(&[a, b, c, b]));
    }

    #[test]
    fn canonical_order_checked_on_non_coinbase_only() {
        let coinbase = Transaction::coinbase(
            1,
            vec![TxOutput {
                value: 10,
                script: Script::pay_to_address(&[0u8; 20]),
                token: None,
            }],
        );
        let mut txs: Vec<Transaction> = (0u8..3)
            .map(|i| {
                Transaction::new(
                    vec![crate::types::transaction::TxInput {
                        prev_out: crate::types::OutPoint::new([i + 1; 32], 0),
                        signature: vec![],
                        pubkey: vec![],
                    }],
                    vec![TxOutput {
                        value: 1,
                        script: Script::pay_to_address(&[i; 20]),
                        token: None,
                    }],
                )
            })
            .collect();
        txs.sort_by_key(|tx| tx.hash());

        let mut transactions = vec![coinbase];
        transactions.extend(txs);
        let block = Block {
            header: header(),
            transactions,
        };
        assert!(block.has_canonical_order());

        let mut shuffled = block.clone();
        shuffled.transactions.swap(1, 3);
        assert!(!shuffled.has_canonical_order());
    }
}
