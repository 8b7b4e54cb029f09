pub mod block;
pub mod transaction;

pub use block::{compute_merkle_root, Block, BlockHeader};
pub use transaction::{
    OutPoint, Script, ScriptType, TokenData, Transaction, TxInput, TxOutput,
};

/// 32-byte BLAKE3 digest; block, transaction, and token identity.
pub type Hash = [u8; 32];

/// 20-byte account identifier derived from a compressed public key.
pub type Address = [u8; 20];

/// Sentinel hash: genesis parent and coinbase outpoint marker.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Block format version understood by this node.
pub const BLOCK_VERSION: u32 = 1;

/// Transaction format version understood by this node.
pub const TX_VERSION: u32 = 1;
