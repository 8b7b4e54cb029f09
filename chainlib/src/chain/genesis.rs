//! Deterministic genesis construction from configured allocations.

use crate::crypto::signature::PUBKEY_LEN;
use crate::types::block::{Block, BlockHeader};
use crate::types::transaction::{Script, Transaction, TxOutput};
use crate::types::{Address, ZERO_HASH};

/// Initial chain allocation.
#[derive(Debug, Clone, Default)]
pub struct GenesisConfig {
    /// Genesis block timestamp, seconds
    pub timestamp: u64,
    /// Plain value grants: address, amount
    pub allocations: Vec<(Address, u64)>,
    /// Pre-bonded validator stakes: pubkey, amount
    pub stakes: Vec<([u8; PUBKEY_LEN], u64)>,
}

/// Build the height-0 block. Its single transaction carries every grant;
/// genesis outputs are spendable immediately (no maturity, no lock).
pub fn build_genesis(config: &GenesisConfig) -> Block {
    let mut outputs = Vec::with_capacity(config.allocations.len() + config.stakes.len());
    for (address, value) in &config.allocations {
        outputs.push(TxOutput {
            value: *value,
            script: Script::pay_to_address(address),
            token: None,
        });
    }
    for (pubkey, value) in &config.stakes {
        outputs.push(TxOutput {
            value: *value,
            script: Script::stake(pubkey),
            token: None,
        });
    }

    let allocation = Transaction::coinbase(0, outputs);
    let mut block = Block {
        header: BlockHeader {
            version: crate::types::BLOCK_VERSION,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            timestamp: config.timestamp,
            height: 0,
            difficulty: 1,
            nonce: 0,
            validator_sig: Vec::new(),
        },
        transactions: vec![allocation],
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic() {
        let config = GenesisConfig {
            timestamp: 1_700_000_000,
            allocations: vec![([1u8; 20], 1_000), ([2u8; 20], 2_000)],
            stakes: vec![([0x02u8; 33], 500)],
        };
        let a = build_genesis(&config);
        let b = build_genesis(&config);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.header.height, 0);
        assert_eq!(a.header.prev_hash, ZERO_HASH);
        assert_eq!(a.transactions.len(), 1);
        assert_eq!(a.transactions[0].outputs.len(), 3);
        assert_eq!(a.compute_merkle_root(), a.header.merkle_root);
    }
}
