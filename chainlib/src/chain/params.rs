use crate::validation::{BlockPolicy, TxPolicy};

/// Consensus and policy parameters for one chain instance.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Maximum newly minted amount per block (fees recycle on top)
    pub block_reward: u64,
    /// Hard supply cap; 0 disables the cap
    pub max_supply: u64,
    /// Confirmations before a coinbase output may be spent
    pub coinbase_maturity: u64,
    /// Blocks a post-unstake change output stays locked
    pub unstake_cooldown: u64,
    /// Exact value every Stake output must bond; 0 disables the check
    pub validator_stake: u64,
    /// Minimum fee for a transaction that mints a token
    pub token_creation_fee: u64,
    /// Deepest reorganization the node will follow
    pub max_reorg_depth: u64,
    /// Maximum transactions per block
    pub max_block_txs: usize,
    /// Maximum serialized block size in bytes
    pub max_block_size: usize,
    /// Maximum inputs per transaction
    pub max_tx_inputs: usize,
    /// Maximum outputs per transaction
    pub max_tx_outputs: usize,
    /// Maximum script data bytes per output
    pub max_script_data: usize,
    /// Tolerated clock drift for incoming block timestamps, seconds
    pub max_future_drift: u64,
    /// Reject blocks whose signer exceeds the signing limit. Off by
    /// default: the weighted difficulty already dominates fork choice and
    /// the miner self-throttles.
    pub enforce_signing_limit: bool,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            block_reward: 50_000_000,
            max_supply: 0,
            coinbase_maturity: 100,
            unstake_cooldown: 720,
            validator_stake: 0,
            token_creation_fee: 1_000_000,
            max_reorg_depth: 50,
            max_block_txs: 4_096,
            max_block_size: 1_000_000,
            max_tx_inputs: 1_024,
            max_tx_outputs: 1_024,
            max_script_data: 256,
            max_future_drift: 120,
            enforce_signing_limit: false,
        }
    }
}

impl ChainParams {
    pub fn tx_policy(&self) -> TxPolicy {
        TxPolicy {
            max_inputs: self.max_tx_inputs,
            max_outputs: self.max_tx_outputs,
            max_script_data: self.max_script_data,
        }
    }

    pub fn block_policy(&self) -> BlockPolicy {
        BlockPolicy {
            max_block_size: self.max_block_size,
            max_block_txs: self.max_block_txs,
            tx_policy: self.tx_policy(),
        }
    }
}
