//! Layered node configuration: `config.toml` overlaid with `MERIDIAN_*`
//! environment variables. Every field has a default so a bare devnet runs
//! from an empty file.

use anyhow::{bail, Context};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use chainlib::chain::{ChainParams, GenesisConfig};
use chainlib::mempool::MempoolConfig;
use chainlib::types::Address;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub chain: ChainSection,
    pub consensus: ConsensusSection,
    pub mempool: MempoolSection,
    pub miner: MinerSection,
    pub genesis: GenesisSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub network_name: String,
    pub data_dir: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            network_name: "meridian-devnet".to_string(),
            data_dir: "meridian-data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSection {
    pub block_reward: u64,
    pub max_supply: u64,
    pub coinbase_maturity: u64,
    pub unstake_cooldown: u64,
    pub validator_stake: u64,
    pub token_creation_fee: u64,
    pub max_reorg_depth: u64,
}

impl Default for ChainSection {
    fn default() -> Self {
        let defaults = ChainParams::default();
        Self {
            block_reward: defaults.block_reward,
            max_supply: defaults.max_supply,
            coinbase_maturity: defaults.coinbase_maturity,
            unstake_cooldown: defaults.unstake_cooldown,
            validator_stake: defaults.validator_stake,
            token_creation_fee: defaults.token_creation_fee,
            max_reorg_depth: defaults.max_reorg_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// Slot length in seconds
    pub block_time: u64,
    /// Hex-encoded 33-byte compressed validator pubkeys
    pub validators: Vec<String>,
    /// Minimum bonded stake for non-genesis signers
    pub min_stake: u64,
    pub enforce_signing_limit: bool,
    /// Liveness heartbeat interval, seconds
    pub heartbeat_interval: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            block_time: 10,
            validators: Vec::new(),
            min_stake: 0,
            enforce_signing_limit: false,
            heartbeat_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolSection {
    pub max_transactions: usize,
    pub min_fee_rate: u64,
}

impl Default for MempoolSection {
    fn default() -> Self {
        let defaults = MempoolConfig::default();
        Self {
            max_transactions: defaults.max_transactions,
            min_fee_rate: defaults.min_fee_rate,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerSection {
    pub enable: bool,
    /// File holding the hex-encoded 32-byte signing secret
    pub key_file: Option<String>,
    /// Hex-encoded 20-byte reward address; defaults to the signer's own
    pub reward_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisSection {
    pub timestamp: u64,
    pub allocations: Vec<GenesisAllocation>,
}

impl Default for GenesisSection {
    fn default() -> Self {
        Self {
            // 2025-01-01T00:00:00Z; must match across all validators
            timestamp: 1_735_689_600,
            allocations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    /// Hex-encoded 20-byte address
    pub address: String,
    pub amount: u64,
}

impl NodeConfig {
    /// Load from `path` (optional) with `MERIDIAN_*` overrides, e.g.
    /// `MERIDIAN_CONSENSUS__BLOCK_TIME=5`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("MERIDIAN").separator("__"))
            .build()
            .context("building configuration")?;
        config
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            block_reward: self.chain.block_reward,
            max_supply: self.chain.max_supply,
            coinbase_maturity: self.chain.coinbase_maturity,
            unstake_cooldown: self.chain.unstake_cooldown,
            validator_stake: self.chain.validator_stake,
            token_creation_fee: self.chain.token_creation_fee,
            max_reorg_depth: self.chain.max_reorg_depth,
            enforce_signing_limit: self.consensus.enforce_signing_limit,
            ..ChainParams::default()
        }
    }

    pub fn mempool_config(&self) -> MempoolConfig {
        MempoolConfig {
            max_transactions: self.mempool.max_transactions,
            min_fee_rate: self.mempool.min_fee_rate,
            coinbase_maturity: self.chain.coinbase_maturity,
            token_creation_fee: self.chain.token_creation_fee,
            validator_stake: self.chain.validator_stake,
            ..MempoolConfig::default()
        }
    }

    pub fn validator_keys(&self) -> anyhow::Result<Vec<[u8; 33]>> {
        let mut keys = Vec::with_capacity(self.consensus.validators.len());
        for entry in &self.consensus.validators {
            let bytes = hex::decode(entry.trim())
                .with_context(|| format!("validator key {entry} is not hex"))?;
            if bytes.len() != 33 {
                bail!("validator key {entry} is not 33 bytes");
            }
            let mut key = [0u8; 33];
            key.copy_from_slice(&bytes);
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn genesis_config(&self) -> anyhow::Result<GenesisConfig> {
        let mut allocations: Vec<(Address, u64)> =
            Vec::with_capacity(self.genesis.allocations.len());
        for entry in &self.genesis.allocations {
            let bytes = hex::decode(entry.address.trim())
                .with_context(|| format!("genesis address {} is not hex", entry.address))?;
            if bytes.len() != 20 {
                bail!("genesis address {} is not 20 bytes", entry.address);
            }
            let mut address = [0u8; 20];
            address.copy_from_slice(&bytes);
            allocations.push((address, entry.amount));
        }
        Ok(GenesisConfig {
            timestamp: self.genesis.timestamp,
            allocations,
            stakes: Vec::new(),
        })
    }
}
