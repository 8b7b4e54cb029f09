use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::storage::undo::UndoRecord;
use crate::storage::StorageError;
use crate::types::block::Block;
use crate::types::Hash;

const BLOCKS_TREE: &str = "blocks";
const HEIGHTS_TREE: &str = "heights";
const TX_INDEX_TREE: &str = "tx_index";
const UNDO_TREE: &str = "undo";
const META_TREE: &str = "meta";

const META_TIP: &[u8] = b"tip";
const META_HEIGHT: &[u8] = b"height";
const META_SUPPLY: &[u8] = b"supply";
const META_CUMDIFF: &[u8] = b"cumdiff";
const META_REORG: &[u8] = b"reorg";

/// Where a confirmed transaction lives on the active chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub height: u64,
    pub block_hash: Hash,
}

/// Persisted chain-state summary, written last in every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    pub tip_hash: Hash,
    pub height: u64,
    pub supply: u64,
    pub cumulative_difficulty: u64,
}

/// Block persistence: block-by-hash, height index, transaction location
/// index, undo records, and the chain-state metadata keys.
///
/// sled has no cross-tree transactions, so `commit_block` emulates the
/// all-or-nothing contract with a fixed write order (undo record first,
/// state tip last); crash recovery keys off the reorg checkpoint, not off
/// partial writes.
pub struct BlockStore {
    db: sled::Db,
    blocks: sled::Tree,
    heights: sled::Tree,
    tx_index: sled::Tree,
    undo: sled::Tree,
    meta: sled::Tree,
}

impl BlockStore {
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            blocks: db.open_tree(BLOCKS_TREE)?,
            heights: db.open_tree(HEIGHTS_TREE)?,
            tx_index: db.open_tree(TX_INDEX_TREE)?,
            undo: db.open_tree(UNDO_TREE)?,
            meta: db.open_tree(META_TREE)?,
            db: db.clone(),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::new(&db)
    }

    // ---- blocks ----

    /// Store a block and index it as part of the active chain: by hash,
    /// by height, and every transaction by its location.
    pub fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        let hash = block.hash();
        self.blocks.insert(hash, bincode::serialize(block)?)?;
        self.heights
            .insert(block.header.height.to_be_bytes(), hash.to_vec())?;
        for tx in &block.transactions {
            let mut loc = Vec::with_capacity(40);
            loc.extend_from_slice(&block.header.height.to_be_bytes());
            loc.extend_from_slice(&hash);
            self.tx_index.insert(tx.hash(), loc)?;
        }
        trace!(height = block.header.height, hash = %hex::encode(hash), "indexed block");
        Ok(())
    }

    /// Store a block by hash only. Used for fork blocks that are not (yet)
    /// part of the active chain.
    pub fn store_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks.insert(block.hash(), bincode::serialize(block)?)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(hash)?)
    }

    pub fn get_hash_by_height(&self, height: u64) -> Result<Option<Hash>, StorageError> {
        match self.heights.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_hash(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match self.get_hash_by_height(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    pub fn delete_height(&self, height: u64) -> Result<(), StorageError> {
        self.heights.remove(height.to_be_bytes())?;
        Ok(())
    }

    /// Highest height present in the height index.
    pub fn max_indexed_height(&self) -> Result<Option<u64>, StorageError> {
        match self.heights.last()? {
            Some((key, _)) => {
                if key.len() != 8 {
                    return Err(StorageError::Corruption(
                        "height key is not 8 bytes".to_string(),
                    ));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }

    // ---- transaction index ----

    pub fn get_tx_location(&self, tx_hash: &Hash) -> Result<Option<TxLocation>, StorageError> {
        match self.tx_index.get(tx_hash)? {
            Some(bytes) => {
                if bytes.len() != 40 {
                    return Err(StorageError::Corruption(
                        "tx location entry is not height + hash".to_string(),
                    ));
                }
                let mut height = [0u8; 8];
                height.copy_from_slice(&bytes[..8]);
                Ok(Some(TxLocation {
                    height: u64::from_be_bytes(height),
                    block_hash: decode_hash(&bytes[8..])?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn delete_tx_index(&self, tx_hash: &Hash) -> Result<(), StorageError> {
        self.tx_index.remove(tx_hash)?;
        Ok(())
    }

    /// Drop every tx-location entry whose block is not in `active`. Used by
    /// the rebuild path to purge entries left behind by a reverted branch.
    pub fn retain_tx_index<F>(&self, active: F) -> Result<(), StorageError>
    where
        F: Fn(&Hash) -> bool,
    {
        let mut stale = Vec::new();
        for entry in self.tx_index.iter() {
            let (key, bytes) = entry?;
            if bytes.len() != 40 {
                return Err(StorageError::Corruption(
                    "tx location entry is not height + hash".to_string(),
                ));
            }
            let block_hash = decode_hash(&bytes[8..])?;
            if !active(&block_hash) {
                stale.push(key);
            }
        }
        for key in stale {
            self.tx_index.remove(key)?;
        }
        Ok(())
    }

    // ---- undo records ----

    pub fn put_undo(&self, block_hash: &Hash, undo: &UndoRecord) -> Result<(), StorageError> {
        self.undo.insert(block_hash, bincode::serialize(undo)?)?;
        Ok(())
    }

    pub fn get_undo(&self, block_hash: &Hash) -> Result<Option<UndoRecord>, StorageError> {
        match self.undo.get(block_hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_undo(&self, block_hash: &Hash) -> Result<(), StorageError> {
        self.undo.remove(block_hash)?;
        Ok(())
    }

    // ---- chain state ----

    pub fn put_state(&self, state: &StoredState) -> Result<(), StorageError> {
        self.meta.insert(META_TIP, state.tip_hash.to_vec())?;
        self.meta
            .insert(META_HEIGHT, state.height.to_be_bytes().to_vec())?;
        self.meta
            .insert(META_SUPPLY, state.supply.to_be_bytes().to_vec())?;
        self.meta.insert(
            META_CUMDIFF,
            state.cumulative_difficulty.to_be_bytes().to_vec(),
        )?;
        Ok(())
    }

    pub fn get_state(&self) -> Result<Option<StoredState>, StorageError> {
        let tip = match self.meta.get(META_TIP)? {
            Some(bytes) => decode_hash(&bytes)?,
            None => return Ok(None),
        };
        Ok(Some(StoredState {
            tip_hash: tip,
            height: self.get_meta_u64(META_HEIGHT)?,
            supply: self.get_meta_u64(META_SUPPLY)?,
            cumulative_difficulty: self.get_meta_u64(META_CUMDIFF)?,
        }))
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, StorageError> {
        match self.meta.get(key)? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    return Err(StorageError::Corruption(format!(
                        "meta key {} is not a u64",
                        String::from_utf8_lossy(key)
                    )));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            None => Err(StorageError::Corruption(format!(
                "meta key {} missing while tip is present",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    // ---- reorg checkpoint ----

    pub fn put_reorg_checkpoint(&self, fork_height: u64) -> Result<(), StorageError> {
        self.meta
            .insert(META_REORG, fork_height.to_be_bytes().to_vec())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_reorg_checkpoint(&self) -> Result<Option<u64>, StorageError> {
        match self.meta.get(META_REORG)? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    return Err(StorageError::Corruption(
                        "reorg checkpoint is not a u64".to_string(),
                    ));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }

    pub fn clear_reorg_checkpoint(&self) -> Result<(), StorageError> {
        self.meta.remove(META_REORG)?;
        self.db.flush()?;
        Ok(())
    }

    // ---- commit ----

    /// Persist one applied block. Write order is the atomicity emulation:
    /// the undo record lands before the block becomes reachable through the
    /// indexes, and the state tip is written last.
    pub fn commit_block(
        &self,
        block: &Block,
        undo: &UndoRecord,
        state: &StoredState,
    ) -> Result<(), StorageError> {
        self.put_undo(&block.hash(), undo)?;
        self.put_block(block)?;
        self.put_state(state)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_hash(bytes: &[u8]) -> Result<Hash, StorageError> {
    if bytes.len() != 32 {
        return Err(StorageError::Corruption(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    Ok(hash)
}
