pub mod block_store;
pub mod undo;
pub mod utxo_set;

pub use block_store::{BlockStore, StoredState, TxLocation};
pub use undo::UndoRecord;
pub use utxo_set::{Utxo, UtxoProvider, UtxoSet};

use thiserror::Error;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("corrupt store: {0}")]
    Corruption(String),
}
