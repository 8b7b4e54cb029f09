use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::signature::PUBKEY_LEN;
use crate::storage::StorageError;
use crate::types::transaction::{Script, ScriptType, TokenData};
use crate::types::OutPoint;

const UTXOS_TREE: &str = "utxos";
const STAKE_INDEX_TREE: &str = "stake_index";

/// A single unspent transaction output together with the chain metadata
/// that gates its spendability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    /// Location of the output
    pub outpoint: OutPoint,
    /// Amount in base currency units
    pub value: u64,
    /// Spending condition
    pub script: Script,
    /// Optional token payload
    pub token: Option<TokenData>,
    /// Height of the block that created this output
    pub height: u64,
    /// Created by a coinbase; subject to the maturity window
    pub is_coinbase: bool,
    /// When non-zero, unspendable until the chain reaches this height
    pub locked_until: u64,
}

/// Read access to the UTXO set, used by transaction validation.
pub trait UtxoProvider {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, StorageError>;
}

/// The outpoint-keyed UTXO map plus a derived stake index.
///
/// The stake index maps `(validator pubkey, outpoint)` to the stake UTXO
/// and is maintained in the same write path as the primary map, so any
/// reader that observes a tip observes a consistent stake view.
pub struct UtxoSet {
    utxos: sled::Tree,
    stake_index: sled::Tree,
}

impl UtxoSet {
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            utxos: db.open_tree(UTXOS_TREE)?,
            stake_index: db.open_tree(STAKE_INDEX_TREE)?,
        })
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, StorageError> {
        match self.utxos.get(outpoint.to_key())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, outpoint: &OutPoint) -> Result<bool, StorageError> {
        Ok(self.utxos.contains_key(outpoint.to_key())?)
    }

    /// Insert a UTXO, updating the stake index when it carries a Stake
    /// script with a well-formed validator key.
    pub fn put(&self, utxo: &Utxo) -> Result<(), StorageError> {
        let bytes = bincode::serialize(utxo)?;
        self.utxos.insert(utxo.outpoint.to_key(), bytes)?;
        if let Some(key) = stake_key(utxo) {
            self.stake_index.insert(key, &[][..])?;
        }
        Ok(())
    }

    /// Remove a UTXO, returning its last state. The stake index entry is
    /// removed in the same path.
    pub fn delete(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, StorageError> {
        let removed = match self.utxos.remove(outpoint.to_key())? {
            Some(bytes) => Some(bincode::deserialize::<Utxo>(&bytes)?),
            None => None,
        };
        if let Some(utxo) = &removed {
            if let Some(key) = stake_key(utxo) {
                self.stake_index.remove(key)?;
            }
        }
        Ok(removed)
    }

    /// Visit every UTXO in the set.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), StorageError>
    where
        F: FnMut(&Utxo),
    {
        for entry in self.utxos.iter() {
            let (_, bytes) = entry?;
            let utxo: Utxo = bincode::deserialize(&bytes)?;
            f(&utxo);
        }
        Ok(())
    }

    /// Drop every entry, stake index included. Used by the rebuild path.
    pub fn clear_all(&self) -> Result<(), StorageError> {
        self.utxos.clear()?;
        self.stake_index.clear()?;
        debug!("UTXO set cleared");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    /// All stake UTXOs bonded to a validator key.
    pub fn get_stakes(&self, pubkey: &[u8]) -> Result<Vec<Utxo>, StorageError> {
        let mut stakes = Vec::new();
        for entry in self.stake_index.scan_prefix(pubkey) {
            let (key, _) = entry?;
            let outpoint = OutPoint::from_key(&key[PUBKEY_LEN..]).ok_or_else(|| {
                StorageError::Corruption(format!(
                    "stake index key of length {} is not pubkey + outpoint",
                    key.len()
                ))
            })?;
            match self.get(&outpoint)? {
                Some(utxo) => stakes.push(utxo),
                None => {
                    return Err(StorageError::Corruption(format!(
                        "stake index references missing UTXO {outpoint}"
                    )))
                }
            }
        }
        Ok(stakes)
    }

    /// Distinct validator keys that currently hold at least one stake UTXO.
    pub fn get_all_staked_validators(&self) -> Result<Vec<[u8; PUBKEY_LEN]>, StorageError> {
        let mut validators: Vec<[u8; PUBKEY_LEN]> = Vec::new();
        for entry in self.stake_index.iter() {
            let (key, _) = entry?;
            if key.len() < PUBKEY_LEN {
                return Err(StorageError::Corruption(
                    "stake index key shorter than a pubkey".to_string(),
                ));
            }
            let mut pubkey = [0u8; PUBKEY_LEN];
            pubkey.copy_from_slice(&key[..PUBKEY_LEN]);
            if validators.last() != Some(&pubkey) {
                validators.push(pubkey);
            }
        }
        Ok(validators)
    }
}

impl UtxoProvider for UtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, StorageError> {
        self.get(outpoint)
    }
}

/// Stake index key for a UTXO, if it is a stake bond: pubkey ‖ outpoint.
fn stake_key(utxo: &Utxo) -> Option<Vec<u8>> {
    if utxo.script.script_type != ScriptType::Stake || utxo.script.data.len() != PUBKEY_LEN {
        return None;
    }
    let mut key = Vec::with_capacity(PUBKEY_LEN + 36);
    key.extend_from_slice(&utxo.script.data);
    key.extend_from_slice(&utxo.outpoint.to_key());
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::Script;

    fn open_set() -> (tempfile::TempDir, UtxoSet) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path()).expect("open sled");
        let set = UtxoSet::new(&db).expect("open utxo set");
        (dir, set)
    }

    fn plain_utxo(txid: u8, vout: u32, value: u64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new([txid; 32], vout),
            value,
            script: Script::pay_to_address(&[txid; 20]),
            token: None,
            height: 1,
            is_coinbase: false,
            locked_until: 0,
        }
    }

    fn stake_utxo(txid: u8, pubkey: [u8; 33], value: u64) -> Utxo {
        Utxo {
            outpoint: OutPoint::new([txid; 32], 0),
            value,
            script: Script::stake(&pubkey),
            token: None,
            height: 1,
            is_coinbase: false,
            locked_until: 0,
        }
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_dir, set) = open_set();
        let utxo = plain_utxo(1, 0, 1_000);

        set.put(&utxo).expect("put");
        assert!(set.has(&utxo.outpoint).expect("has"));
        assert_eq!(set.get(&utxo.outpoint).expect("get"), Some(utxo.clone()));

        let removed = set.delete(&utxo.outpoint).expect("delete");
        assert_eq!(removed, Some(utxo.clone()));
        assert!(!set.has(&utxo.outpoint).expect("has"));
        assert_eq!(set.delete(&utxo.outpoint).expect("delete"), None);
    }

    #[test]
    fn stake_index_follows_primary_map() {
        let (_dir, set) = open_set();
        let pk_a = [0x02u8; 33];
        let pk_b = [0x03u8; 33];

        set.put(&stake_utxo(1, pk_a, 500)).expect("put");
        set.put(&stake_utxo(2, pk_a, 700)).expect("put");
        set.put(&stake_utxo(3, pk_b, 900)).expect("put");
        set.put(&plain_utxo(4, 0, 50)).expect("put");

        let stakes_a = set.get_stakes(&pk_a).expect("stakes");
        assert_eq!(stakes_a.len(), 2);
        assert_eq!(stakes_a.iter().map(|u| u.value).sum::<u64>(), 1_200);

        let validators = set.get_all_staked_validators().expect("validators");
        assert_eq!(validators, vec![pk_a, pk_b]);

        set.delete(&OutPoint::new([1; 32], 0)).expect("delete");
        set.delete(&OutPoint::new([2; 32], 0)).expect("delete");
        assert!(set.get_stakes(&pk_a).expect("stakes").is_empty());
        assert_eq!(set.get_all_staked_validators().expect("validators"), vec![pk_b]);
    }

    #[test]
    fn clear_all_empties_both_trees() {
        let (_dir, set) = open_set();
        set.put(&stake_utxo(1, [0x02u8; 33], 500)).expect("put");
        set.put(&plain_utxo(2, 0, 50)).expect("put");
        assert_eq!(set.len(), 2);

        set.clear_all().expect("clear");
        assert!(set.is_empty());
        assert!(set.get_all_staked_validators().expect("validators").is_empty());
    }

    #[test]
    fn for_each_visits_everything() {
        let (_dir, set) = open_set();
        for i in 0..5u8 {
            set.put(&plain_utxo(i, 0, 100 * u64::from(i))).expect("put");
        }
        let mut seen = 0usize;
        set.for_each(|_| seen += 1).expect("for_each");
        assert_eq!(seen, 5);
    }
}
