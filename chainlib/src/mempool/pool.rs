//! The transaction pool: fee-rate ordered, conflict-indexed, bounded with
//! lowest-fee-rate eviction. Admission applies the same maturity, token,
//! and stake policy the chain enforces, as a filter against the current
//! height; consensus re-checks everything in `process_block`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, trace};

use crate::storage::{StorageError, UtxoSet};
use crate::types::transaction::Transaction;
use crate::types::{Hash, OutPoint};
use crate::validation::{
    check_stake_outputs, check_token_rules, check_transaction, validate_with_utxos, TxPolicy,
    TxValidationError,
};

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already exists in mempool")]
    AlreadyExists,

    #[error("transaction conflicts with a mempool transaction")]
    Conflict,

    #[error("mempool is full")]
    PoolFull,

    #[error("fee {fee} below minimum {required} for {size} bytes")]
    FeeTooLow { fee: u64, required: u64, size: usize },

    #[error("input spends an immature coinbase output")]
    ImmatureInput,

    #[error("input locked until height {unlock_height}")]
    LockedInput { unlock_height: u64 },

    #[error("coinbase transactions are not relayed")]
    CoinbaseNotAllowed,

    #[error("lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Validation(#[from] TxValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pool policy knobs.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of pooled transactions
    pub max_transactions: usize,
    /// Minimum fee per signing-bytes byte; 0 disables the floor
    pub min_fee_rate: u64,
    /// Blocks a coinbase output must age before the pool relays a spend
    pub coinbase_maturity: u64,
    /// Minimum fee for token-minting transactions
    pub token_creation_fee: u64,
    /// Exact value required of Stake outputs; 0 disables the check
    pub validator_stake: u64,
    /// Structural bounds, matching chain policy
    pub tx_policy: TxPolicy,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 5_000,
            min_fee_rate: 1,
            coinbase_maturity: 100,
            token_creation_fee: 1_000_000,
            validator_stake: 0,
            tx_policy: TxPolicy::default(),
        }
    }
}

/// A pooled transaction with its admission-time fee metrics.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub transaction: Transaction,
    /// Fee in base units
    pub fee: u64,
    /// Fee per signing-bytes byte
    pub fee_rate: u64,
    /// Signing-bytes length
    pub size: usize,
}

type HeightSource = Arc<dyn Fn() -> u64 + Send + Sync>;

struct MempoolInner {
    txs: HashMap<Hash, MempoolEntry>,
    /// Conflict index: outpoint -> pooled transaction spending it
    spends: HashMap<OutPoint, Hash>,
    config: MempoolConfig,
    utxos: Option<Arc<UtxoSet>>,
    height_source: Option<HeightSource>,
}

/// Thread-safe transaction pool. Owns its own mutex and is never locked
/// while the chain lock is held (chain handlers post to the pool after the
/// chain mutation completes).
pub struct Mempool {
    inner: Mutex<MempoolInner>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            inner: Mutex::new(MempoolInner {
                txs: HashMap::new(),
                spends: HashMap::new(),
                config,
                utxos: None,
                height_source: None,
            }),
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, MempoolInner>, MempoolError> {
        self.inner.lock().map_err(|_| MempoolError::LockPoisoned)
    }

    /// Wire the UTXO set used for fee computation and maturity reads.
    pub fn set_utxo_set(&self, utxos: Arc<UtxoSet>) -> Result<(), MempoolError> {
        self.locked()?.utxos = Some(utxos);
        Ok(())
    }

    /// Wire the current-chain-height source for maturity and lock gating.
    pub fn set_height_source(
        &self,
        source: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Result<(), MempoolError> {
        self.locked()?.height_source = Some(Arc::new(source));
        Ok(())
    }

    pub fn set_min_fee_rate(&self, min_fee_rate: u64) -> Result<(), MempoolError> {
        self.locked()?.config.min_fee_rate = min_fee_rate;
        Ok(())
    }

    pub fn set_validator_stake(&self, validator_stake: u64) -> Result<(), MempoolError> {
        self.locked()?.config.validator_stake = validator_stake;
        Ok(())
    }

    /// Admit a transaction. Returns the fee it pays.
    pub fn add(&self, tx: Transaction) -> Result<u64, MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::CoinbaseNotAllowed);
        }
        // resolve the chain height before taking the pool lock; the height
        // source takes the chain lock and lock nesting is not allowed
        let height_source = self.locked()?.height_source.clone();
        let height = height_source.map(|f| f());

        let mut inner = self.locked()?;
        let tx_hash = tx.hash();

        if inner.txs.contains_key(&tx_hash) {
            return Err(MempoolError::AlreadyExists);
        }
        for input in &tx.inputs {
            if inner.spends.contains_key(&input.prev_out) {
                return Err(MempoolError::Conflict);
            }
        }

        let fee = match (&inner.utxos, height) {
            (Some(utxos), height) => {
                // maturity and cooldown against the current chain height
                if let Some(height) = height {
                    for input in &tx.inputs {
                        if let Some(utxo) = utxos.get(&input.prev_out)? {
                            if utxo.is_coinbase
                                && height.saturating_sub(utxo.height)
                                    < inner.config.coinbase_maturity
                            {
                                return Err(MempoolError::ImmatureInput);
                            }
                            if utxo.locked_until > 0 && height < utxo.locked_until {
                                return Err(MempoolError::LockedInput {
                                    unlock_height: utxo.locked_until,
                                });
                            }
                        }
                    }
                }
                let validated =
                    validate_with_utxos(&tx, utxos.as_ref(), &inner.config.tx_policy)?;
                check_token_rules(
                    &tx,
                    &validated.spent,
                    validated.fee,
                    inner.config.token_creation_fee,
                )?;
                validated.fee
            }
            // no UTXO view wired (stand-alone pool): structural checks only
            (None, _) => {
                check_transaction(&tx, &inner.config.tx_policy)?;
                0
            }
        };
        check_stake_outputs(&tx, inner.config.validator_stake)?;

        let size = tx.signing_bytes().len();
        let fee_rate = fee / size as u64;
        if inner.config.min_fee_rate > 0 && fee < inner.config.min_fee_rate * size as u64 {
            return Err(MempoolError::FeeTooLow {
                fee,
                required: inner.config.min_fee_rate * size as u64,
                size,
            });
        }

        if inner.txs.len() >= inner.config.max_transactions {
            // evict the lowest fee-rate entry, but only for a strictly
            // better newcomer
            let loser = inner
                .txs
                .iter()
                .min_by_key(|(_, entry)| entry.fee_rate)
                .map(|(hash, entry)| (*hash, entry.fee_rate));
            match loser {
                Some((loser_hash, loser_rate)) if fee_rate > loser_rate => {
                    remove_entry(&mut inner, &loser_hash);
                    debug!(evicted = %hex::encode(loser_hash), fee_rate = loser_rate, "evicted lowest fee-rate transaction");
                }
                _ => return Err(MempoolError::PoolFull),
            }
        }

        for input in &tx.inputs {
            inner.spends.insert(input.prev_out, tx_hash);
        }
        inner.txs.insert(
            tx_hash,
            MempoolEntry {
                transaction: tx,
                fee,
                fee_rate,
                size,
            },
        );
        trace!(hash = %hex::encode(tx_hash), fee, fee_rate, "transaction admitted");
        Ok(fee)
    }

    /// Drop a transaction and its conflict-index entries.
    pub fn remove(&self, tx_hash: &Hash) -> Result<Option<Transaction>, MempoolError> {
        let mut inner = self.locked()?;
        Ok(remove_entry(&mut inner, tx_hash).map(|entry| entry.transaction))
    }

    /// Drop every transaction confirmed by a connected block.
    pub fn remove_confirmed(&self, txs: &[Transaction]) -> Result<(), MempoolError> {
        let mut inner = self.locked()?;
        for tx in txs {
            remove_entry(&mut inner, &tx.hash());
        }
        Ok(())
    }

    pub fn has(&self, tx_hash: &Hash) -> Result<bool, MempoolError> {
        Ok(self.locked()?.txs.contains_key(tx_hash))
    }

    pub fn get(&self, tx_hash: &Hash) -> Result<Option<MempoolEntry>, MempoolError> {
        Ok(self.locked()?.txs.get(tx_hash).cloned())
    }

    pub fn count(&self) -> Result<usize, MempoolError> {
        Ok(self.locked()?.txs.len())
    }

    pub fn hashes(&self) -> Result<Vec<Hash>, MempoolError> {
        Ok(self.locked()?.txs.keys().copied().collect())
    }

    /// Up to `limit` transactions, highest fee rate first.
    pub fn select_for_block(&self, limit: usize) -> Result<Vec<Transaction>, MempoolError> {
        let inner = self.locked()?;
        let mut entries: Vec<&MempoolEntry> = inner.txs.values().collect();
        entries.sort_by(|a, b| b.fee_rate.cmp(&a.fee_rate).then(b.fee.cmp(&a.fee)));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.transaction.clone())
            .collect())
    }
}

fn remove_entry(inner: &mut MempoolInner, tx_hash: &Hash) -> Option<MempoolEntry> {
    let entry = inner.txs.remove(tx_hash)?;
    for input in &entry.transaction.inputs {
        if inner.spends.get(&input.prev_out) == Some(tx_hash) {
            inner.spends.remove(&input.prev_out);
        }
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::pubkey_to_address;
    use crate::crypto::signature::Keypair;
    use crate::storage::Utxo;
    use crate::types::transaction::{Script, TxInput, TxOutput};

    fn pool_with_utxos() -> (tempfile::TempDir, Mempool, Arc<UtxoSet>, Keypair) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path()).expect("sled");
        let utxos = Arc::new(UtxoSet::new(&db).expect("utxo set"));
        let pool = Mempool::new(MempoolConfig {
            min_fee_rate: 0,
            ..MempoolConfig::default()
        });
        pool.set_utxo_set(Arc::clone(&utxos)).expect("wire utxos");
        pool.set_height_source(|| 1_000).expect("wire height");
        (dir, pool, utxos, Keypair::generate())
    }

    fn fund(utxos: &UtxoSet, keypair: &Keypair, txid: u8, value: u64) -> OutPoint {
        let outpoint = OutPoint::new([txid; 32], 0);
        utxos
            .put(&Utxo {
                outpoint,
                value,
                script: Script::pay_to_address(&pubkey_to_address(&keypair.public_key())),
                token: None,
                height: 1,
                is_coinbase: false,
                locked_until: 0,
            })
            .expect("fund");
        outpoint
    }

    fn spend(keypair: &Keypair, outpoint: OutPoint, value: u64) -> Transaction {
        let mut tx = Transaction::new(
            vec![TxInput {
                prev_out: outpoint,
                signature: vec![0u8; 64],
                pubkey: keypair.public_key().to_vec(),
            }],
            vec![TxOutput {
                value,
                script: Script::pay_to_address(&[9u8; 20]),
                token: None,
            }],
        );
        let sig = keypair.sign(&tx.hash());
        tx.inputs[0].signature = sig.to_vec();
        tx
    }

    #[test]
    fn add_and_duplicate() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        let outpoint = fund(&utxos, &keypair, 1, 10_000);
        let tx = spend(&keypair, outpoint, 9_000);

        assert_eq!(pool.add(tx.clone()).expect("add"), 1_000);
        assert!(pool.has(&tx.hash()).expect("has"));
        assert!(matches!(pool.add(tx), Err(MempoolError::AlreadyExists)));
    }

    #[test]
    fn conflicting_spend_rejected() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        let outpoint = fund(&utxos, &keypair, 1, 10_000);
        pool.add(spend(&keypair, outpoint, 9_000)).expect("add");
        assert!(matches!(
            pool.add(spend(&keypair, outpoint, 8_000)),
            Err(MempoolError::Conflict)
        ));
    }

    #[test]
    fn immature_coinbase_filtered() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        let outpoint = OutPoint::new([1u8; 32], 0);
        utxos
            .put(&Utxo {
                outpoint,
                value: 10_000,
                script: Script::pay_to_address(&pubkey_to_address(&keypair.public_key())),
                token: None,
                height: 950, // 50 confirmations at height 1000, maturity is 100
                is_coinbase: true,
                locked_until: 0,
            })
            .expect("fund");
        assert!(matches!(
            pool.add(spend(&keypair, outpoint, 9_000)),
            Err(MempoolError::ImmatureInput)
        ));
    }

    #[test]
    fn locked_input_filtered() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        let outpoint = OutPoint::new([1u8; 32], 0);
        utxos
            .put(&Utxo {
                outpoint,
                value: 10_000,
                script: Script::pay_to_address(&pubkey_to_address(&keypair.public_key())),
                token: None,
                height: 1,
                is_coinbase: false,
                locked_until: 1_500,
            })
            .expect("fund");
        assert!(matches!(
            pool.add(spend(&keypair, outpoint, 9_000)),
            Err(MempoolError::LockedInput { unlock_height: 1_500 })
        ));
    }

    #[test]
    fn fee_floor_enforced() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        pool.set_min_fee_rate(10).expect("policy");
        let outpoint = fund(&utxos, &keypair, 1, 10_000);
        // fee of 100 over >10 byte signing bytes is under 10 units/byte
        assert!(matches!(
            pool.add(spend(&keypair, outpoint, 9_900)),
            Err(MempoolError::FeeTooLow { .. })
        ));
    }

    #[test]
    fn eviction_drops_lowest_fee_rate() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        {
            pool.locked().expect("lock").config.max_transactions = 2;
        }
        // same signing-bytes length for all three, fees 1000 / 3000 / 7000
        let low = spend(&keypair, fund(&utxos, &keypair, 1, 10_000), 9_000);
        let mid = spend(&keypair, fund(&utxos, &keypair, 2, 10_000), 7_000);
        let high = spend(&keypair, fund(&utxos, &keypair, 3, 10_000), 3_000);

        pool.add(low.clone()).expect("add low");
        pool.add(mid.clone()).expect("add mid");
        pool.add(high.clone()).expect("add high");

        assert_eq!(pool.count().expect("count"), 2);
        assert!(!pool.has(&low.hash()).expect("has"));
        assert!(pool.has(&mid.hash()).expect("has"));
        assert!(pool.has(&high.hash()).expect("has"));

        // the evicted transaction's inputs are spendable again
        pool.add(spend(&keypair, OutPoint::new([1u8; 32], 0), 1_000))
            .expect("readmit after eviction");
    }

    #[test]
    fn full_pool_rejects_weaker_newcomer() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        {
            pool.locked().expect("lock").config.max_transactions = 1;
        }
        let strong = spend(&keypair, fund(&utxos, &keypair, 1, 10_000), 3_000);
        let weak = spend(&keypair, fund(&utxos, &keypair, 2, 10_000), 9_000);
        pool.add(strong).expect("add");
        assert!(matches!(pool.add(weak), Err(MempoolError::PoolFull)));
    }

    #[test]
    fn select_orders_by_fee_rate() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        let a = spend(&keypair, fund(&utxos, &keypair, 1, 10_000), 9_500);
        let b = spend(&keypair, fund(&utxos, &keypair, 2, 10_000), 5_000);
        let c = spend(&keypair, fund(&utxos, &keypair, 3, 10_000), 8_000);
        pool.add(a.clone()).expect("add");
        pool.add(b.clone()).expect("add");
        pool.add(c.clone()).expect("add");

        let selected = pool.select_for_block(2).expect("select");
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].hash(), b.hash());
        assert_eq!(selected[1].hash(), c.hash());
    }

    #[test]
    fn remove_confirmed_clears_spend_index() {
        let (_dir, pool, utxos, keypair) = pool_with_utxos();
        let outpoint = fund(&utxos, &keypair, 1, 10_000);
        let tx = spend(&keypair, outpoint, 9_000);
        pool.add(tx.clone()).expect("add");

        pool.remove_confirmed(&[tx.clone()]).expect("confirm");
        assert_eq!(pool.count().expect("count"), 0);
        // outpoint free again
        pool.add(spend(&keypair, outpoint, 8_000)).expect("re-add");
    }

    #[test]
    fn coinbase_not_relayed() {
        let (_dir, pool, _utxos, _keypair) = pool_with_utxos();
        let coinbase = Transaction::coinbase(
            5,
            vec![TxOutput {
                value: 50,
                script: Script::pay_to_address(&[1u8; 20]),
                token: None,
            }],
        );
        assert!(matches!(
            pool.add(coinbase),
            Err(MempoolError::CoinbaseNotAllowed)
        ));
    }
}
