// Meridian Chain Library
// Core implementation of the Meridian PoA UTXO chain

pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod mempool;
pub mod storage;
pub mod test_utils;
pub mod types;
pub mod validation;

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use crate::chain::{
    build_genesis, Chain, ChainError, ChainEvent, ChainParams, ChainState, EventSink,
    GenesisConfig, NullSink,
};
pub use crate::consensus::{
    PoaEngine, PoaError, StakeChecker, UtxoStakeChecker, ValidatorTracker, DIFF_IN_TURN,
    DIFF_NO_TURN,
};
pub use crate::crypto::{pubkey_to_address, Keypair, SignatureError};
pub use crate::mempool::{Mempool, MempoolConfig, MempoolError};
pub use crate::storage::{BlockStore, StorageError, UndoRecord, Utxo, UtxoProvider, UtxoSet};
pub use crate::types::{Address, Block, BlockHeader, Hash, OutPoint, Transaction, ZERO_HASH};
pub use crate::validation::{BlockValidationError, TxValidationError};
