//! Proof-of-authority engine: slot election, weighted difficulty, header
//! sealing and verification, stake-backed validator admission.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::crypto::signature::{verify_schnorr, Keypair, PUBKEY_LEN};
use crate::storage::{StorageError, UtxoSet};
use crate::types::block::{Block, BlockHeader};

/// Difficulty of a block signed by the validator whose slot it is.
pub const DIFF_IN_TURN: u64 = 2;

/// Difficulty of a block signed by any other authorized validator.
pub const DIFF_NO_TURN: u64 = 1;

#[derive(Debug, Error)]
pub enum PoaError {
    #[error("header is missing the validator signature")]
    MissingSignature,

    #[error("header signature does not match any authorized validator")]
    InvalidSignature,

    #[error("signer holds insufficient stake")]
    InsufficientStake,

    #[error("header difficulty {got} does not match expected {expected}")]
    BadDifficulty { expected: u64, got: u64 },

    #[error("validator set is empty")]
    EmptyValidatorSet,

    #[error("block time must be non-zero")]
    ZeroBlockTime,

    #[error("no local signer configured")]
    NoSigner,

    #[error("lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Decides whether a (non-genesis) validator is backed by enough stake to
/// sign blocks. Resolved against the stake index at verification time.
pub trait StakeChecker: Send + Sync {
    fn has_stake(&self, pubkey: &[u8; PUBKEY_LEN]) -> Result<bool, StorageError>;
}

/// Stake checker over the UTXO set's stake index: a validator qualifies
/// when the sum of its stake UTXOs reaches `min_stake`.
pub struct UtxoStakeChecker {
    utxos: Arc<UtxoSet>,
    min_stake: u64,
}

impl UtxoStakeChecker {
    pub fn new(utxos: Arc<UtxoSet>, min_stake: u64) -> Self {
        Self { utxos, min_stake }
    }
}

impl StakeChecker for UtxoStakeChecker {
    fn has_stake(&self, pubkey: &[u8; PUBKEY_LEN]) -> Result<bool, StorageError> {
        let mut total: u64 = 0;
        for stake in self.utxos.get_stakes(pubkey)? {
            total = total.saturating_add(stake.value);
        }
        Ok(total >= self.min_stake)
    }
}

struct PoaInner {
    /// Lexicographically ordered, so slot election is independent of
    /// insertion order
    validators: Vec<[u8; PUBKEY_LEN]>,
    /// Founding validators; never removable, exempt from the stake gate
    genesis_validators: HashSet<[u8; PUBKEY_LEN]>,
    signer: Option<Keypair>,
    stake_checker: Option<Arc<dyn StakeChecker>>,
}

/// The PoA engine. Verification is read-only; validator-set changes and
/// signer assignment take the write lock.
pub struct PoaEngine {
    inner: RwLock<PoaInner>,
    block_time: u64,
}

impl PoaEngine {
    pub fn new(validators: Vec<[u8; PUBKEY_LEN]>, block_time: u64) -> Result<Self, PoaError> {
        if validators.is_empty() {
            return Err(PoaError::EmptyValidatorSet);
        }
        if block_time == 0 {
            return Err(PoaError::ZeroBlockTime);
        }
        let mut ordered = validators;
        ordered.sort_unstable();
        ordered.dedup();
        let genesis_validators = ordered.iter().copied().collect();
        Ok(Self {
            inner: RwLock::new(PoaInner {
                validators: ordered,
                genesis_validators,
                signer: None,
                stake_checker: None,
            }),
            block_time,
        })
    }

    pub fn block_time(&self) -> u64 {
        self.block_time
    }

    pub fn set_signer(&self, keypair: Keypair) -> Result<(), PoaError> {
        let mut inner = self.inner.write().map_err(|_| PoaError::LockPoisoned)?;
        debug!(pubkey = %hex::encode(keypair.public_key()), "local signer set");
        inner.signer = Some(keypair);
        Ok(())
    }

    pub fn set_stake_checker(&self, checker: Arc<dyn StakeChecker>) -> Result<(), PoaError> {
        let mut inner = self.inner.write().map_err(|_| PoaError::LockPoisoned)?;
        inner.stake_checker = Some(checker);
        Ok(())
    }

    /// Admit a validator, keeping canonical order. No-op if present.
    pub fn add_validator(&self, pubkey: [u8; PUBKEY_LEN]) -> Result<bool, PoaError> {
        let mut inner = self.inner.write().map_err(|_| PoaError::LockPoisoned)?;
        match inner.validators.binary_search(&pubkey) {
            Ok(_) => Ok(false),
            Err(pos) => {
                inner.validators.insert(pos, pubkey);
                debug!(pubkey = %hex::encode(pubkey), "validator admitted");
                Ok(true)
            }
        }
    }

    /// Remove a non-genesis validator. Genesis members are permanent.
    pub fn remove_validator(&self, pubkey: &[u8; PUBKEY_LEN]) -> Result<bool, PoaError> {
        let mut inner = self.inner.write().map_err(|_| PoaError::LockPoisoned)?;
        if inner.genesis_validators.contains(pubkey) {
            return Ok(false);
        }
        match inner.validators.binary_search(pubkey) {
            Ok(pos) => {
                inner.validators.remove(pos);
                debug!(pubkey = %hex::encode(pubkey), "validator removed");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn validators(&self) -> Result<Vec<[u8; PUBKEY_LEN]>, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        Ok(inner.validators.clone())
    }

    pub fn validator_count(&self) -> Result<usize, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        Ok(inner.validators.len())
    }

    pub fn local_signer(&self) -> Result<Option<[u8; PUBKEY_LEN]>, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        Ok(inner.signer.as_ref().map(|kp| kp.public_key()))
    }

    /// The validator whose slot covers timestamp `ts`.
    pub fn slot_validator(&self, ts: u64) -> Result<[u8; PUBKEY_LEN], PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        Ok(Self::slot_of(&inner.validators, self.block_time, ts))
    }

    /// Whether the local signer owns the slot at `ts`.
    pub fn is_in_turn(&self, ts: u64) -> Result<bool, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        let signer = match &inner.signer {
            Some(kp) => kp.public_key(),
            None => return Ok(false),
        };
        Ok(Self::slot_of(&inner.validators, self.block_time, ts) == signer)
    }

    /// How long the local signer should wait before producing at `ts`.
    /// Zero for the in-turn validator; out-of-turn signers back off by a
    /// distance-scaled fraction of the block time so the slot owner goes
    /// first without a strict lockout.
    pub fn backup_delay(&self, ts: u64) -> Result<Duration, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        let n = inner.validators.len() as u64;
        let signer = match &inner.signer {
            Some(kp) => kp.public_key(),
            None => return Ok(Duration::from_secs(self.block_time)),
        };
        let my_index = match inner.validators.binary_search(&signer) {
            Ok(pos) => pos as u64,
            Err(_) => return Ok(Duration::from_secs(self.block_time)),
        };
        let slot_index = (ts / self.block_time) % n;
        let distance = (my_index + n - slot_index) % n;
        if distance == 0 {
            return Ok(Duration::ZERO);
        }
        let block_time_ms = self.block_time * 1_000;
        Ok(Duration::from_millis(
            block_time_ms / 2 + (distance - 1) * block_time_ms / (2 * n),
        ))
    }

    /// Assign the weighted difficulty for a header the local signer is
    /// about to produce.
    pub fn prepare(&self, header: &mut BlockHeader) -> Result<(), PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        let signer = inner.signer.as_ref().ok_or(PoaError::NoSigner)?;
        let in_turn =
            Self::slot_of(&inner.validators, self.block_time, header.timestamp)
                == signer.public_key();
        header.difficulty = if in_turn { DIFF_IN_TURN } else { DIFF_NO_TURN };
        Ok(())
    }

    /// Sign the block header with the local signer.
    pub fn seal(&self, block: &mut Block) -> Result<(), PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        let signer = inner.signer.as_ref().ok_or(PoaError::NoSigner)?;
        let sig = signer.sign(&block.header.hash());
        block.header.validator_sig = sig.to_vec();
        Ok(())
    }

    /// Verify a sealed header: signature by some authorized validator,
    /// stake backing for non-genesis signers, and exact difficulty for the
    /// signer's relation to the slot.
    ///
    /// Any authorized signer is accepted regardless of slot; out-of-turn
    /// blocks simply carry less weight.
    pub fn verify_header(&self, header: &BlockHeader) -> Result<(), PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        if header.validator_sig.is_empty() {
            return Err(PoaError::MissingSignature);
        }
        let signer = Self::find_signer(&inner.validators, header)
            .ok_or(PoaError::InvalidSignature)?;

        if let Some(checker) = &inner.stake_checker {
            if !inner.genesis_validators.contains(&signer) && !checker.has_stake(&signer)? {
                return Err(PoaError::InsufficientStake);
            }
        }

        let expected =
            if Self::slot_of(&inner.validators, self.block_time, header.timestamp) == signer {
                DIFF_IN_TURN
            } else {
                DIFF_NO_TURN
            };
        if header.difficulty != expected {
            return Err(PoaError::BadDifficulty {
                expected,
                got: header.difficulty,
            });
        }
        Ok(())
    }

    /// Which validator signed the header, if any. Schnorr has no signer
    /// recovery, so this is a linear scan over the validator set.
    pub fn identify_signer(
        &self,
        header: &BlockHeader,
    ) -> Result<Option<[u8; PUBKEY_LEN]>, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        Ok(Self::find_signer(&inner.validators, header))
    }

    /// A validator may sign at most one of any `signing_limit` consecutive
    /// blocks; 0 means no limit (single-validator networks).
    pub fn signing_limit(&self) -> Result<u64, PoaError> {
        let inner = self.inner.read().map_err(|_| PoaError::LockPoisoned)?;
        let n = inner.validators.len() as u64;
        if n < 2 {
            return Ok(0);
        }
        Ok(n / 2 + 1)
    }

    fn slot_of(validators: &[[u8; PUBKEY_LEN]], block_time: u64, ts: u64) -> [u8; PUBKEY_LEN] {
        let index = (ts / block_time) % validators.len() as u64;
        validators[index as usize]
    }

    fn find_signer(
        validators: &[[u8; PUBKEY_LEN]],
        header: &BlockHeader,
    ) -> Option<[u8; PUBKEY_LEN]> {
        let msg = header.hash();
        validators
            .iter()
            .find(|pk| verify_schnorr(&pk[..], &msg, &header.validator_sig).unwrap_or(false))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_HASH;

    fn keypairs(n: usize) -> Vec<Keypair> {
        (0..n).map(|_| Keypair::generate()).collect()
    }

    fn engine_with(keys: &[Keypair], block_time: u64) -> PoaEngine {
        let validators = keys.iter().map(|k| k.public_key()).collect();
        PoaEngine::new(validators, block_time).expect("engine")
    }

    fn header_at(ts: u64, difficulty: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            timestamp: ts,
            height: 1,
            difficulty,
            nonce: 0,
            validator_sig: Vec::new(),
        }
    }

    fn seal_header(header: &mut BlockHeader, keypair: &Keypair) {
        header.validator_sig = keypair.sign(&header.hash()).to_vec();
    }

    #[test]
    fn canonical_order_is_input_order_independent() {
        let keys = keypairs(4);
        let forward: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = PoaEngine::new(forward, 5).expect("engine");
        let b = PoaEngine::new(reversed, 5).expect("engine");
        for ts in (0..200).step_by(7) {
            assert_eq!(
                a.slot_validator(ts).expect("slot"),
                b.slot_validator(ts).expect("slot")
            );
        }
    }

    #[test]
    fn slot_rotates_every_block_time() {
        let keys = keypairs(3);
        let engine = engine_with(&keys, 10);
        let slot0 = engine.slot_validator(0).expect("slot");
        let slot1 = engine.slot_validator(10).expect("slot");
        let slot2 = engine.slot_validator(20).expect("slot");
        assert_ne!(slot0, slot1);
        assert_ne!(slot1, slot2);
        assert_eq!(slot0, engine.slot_validator(30).expect("slot"));
        assert_eq!(slot0, engine.slot_validator(9).expect("slot"));
    }

    #[test]
    fn verify_rejects_missing_and_foreign_signatures() {
        let keys = keypairs(2);
        let engine = engine_with(&keys, 5);

        let header = header_at(0, DIFF_IN_TURN);
        assert!(matches!(
            engine.verify_header(&header),
            Err(PoaError::MissingSignature)
        ));

        let outsider = Keypair::generate();
        let mut signed = header_at(0, DIFF_IN_TURN);
        seal_header(&mut signed, &outsider);
        assert!(matches!(
            engine.verify_header(&signed),
            Err(PoaError::InvalidSignature)
        ));
    }

    #[test]
    fn verify_enforces_exact_difficulty() {
        let keys = keypairs(2);
        let engine = engine_with(&keys, 5);
        let validators = engine.validators().expect("validators");

        let in_turn_pk = engine.slot_validator(0).expect("slot");
        let in_turn = keys
            .iter()
            .find(|k| k.public_key() == in_turn_pk)
            .expect("present");
        let out_of_turn = keys
            .iter()
            .find(|k| k.public_key() != in_turn_pk)
            .expect("present");
        assert_eq!(validators.len(), 2);

        // correctly weighted headers verify
        let mut good_in = header_at(0, DIFF_IN_TURN);
        seal_header(&mut good_in, in_turn);
        engine.verify_header(&good_in).expect("in-turn verifies");

        let mut good_out = header_at(0, DIFF_NO_TURN);
        seal_header(&mut good_out, out_of_turn);
        engine.verify_header(&good_out).expect("out-of-turn verifies");

        // an out-of-turn signer claiming in-turn weight is rejected
        let mut cheat = header_at(0, DIFF_IN_TURN);
        seal_header(&mut cheat, out_of_turn);
        assert!(matches!(
            engine.verify_header(&cheat),
            Err(PoaError::BadDifficulty { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn prepare_assigns_weight_for_local_signer() {
        let keys = keypairs(2);
        let engine = engine_with(&keys, 5);
        let in_turn_pk = engine.slot_validator(0).expect("slot");
        let in_turn = keys
            .iter()
            .find(|k| k.public_key() == in_turn_pk)
            .expect("present")
            .clone();
        engine.set_signer(in_turn).expect("signer");

        let mut header = header_at(0, 0);
        engine.prepare(&mut header).expect("prepare");
        assert_eq!(header.difficulty, DIFF_IN_TURN);

        // next slot belongs to the other validator
        header.timestamp = 5;
        engine.prepare(&mut header).expect("prepare");
        assert_eq!(header.difficulty, DIFF_NO_TURN);
    }

    #[test]
    fn backup_delay_zero_only_in_turn() {
        let keys = keypairs(3);
        let engine = engine_with(&keys, 6);
        let in_turn_pk = engine.slot_validator(0).expect("slot");
        for key in &keys {
            engine.set_signer(key.clone()).expect("signer");
            let delay = engine.backup_delay(0).expect("delay");
            if key.public_key() == in_turn_pk {
                assert_eq!(delay, Duration::ZERO);
            } else {
                assert!(delay > Duration::ZERO);
                assert!(delay < Duration::from_secs(6));
            }
        }
    }

    #[test]
    fn signing_limit_is_majority() {
        let keys = keypairs(1);
        let engine = engine_with(&keys, 5);
        assert_eq!(engine.signing_limit().expect("limit"), 0);

        let keys = keypairs(4);
        let engine = engine_with(&keys, 5);
        assert_eq!(engine.signing_limit().expect("limit"), 3);
    }

    #[test]
    fn genesis_validators_are_permanent() {
        let keys = keypairs(2);
        let engine = engine_with(&keys, 5);
        let genesis_pk = keys[0].public_key();
        assert!(!engine.remove_validator(&genesis_pk).expect("remove"));

        let joiner = Keypair::generate().public_key();
        assert!(engine.add_validator(joiner).expect("add"));
        assert!(!engine.add_validator(joiner).expect("add twice"));
        assert_eq!(engine.validator_count().expect("count"), 3);
        assert!(engine.remove_validator(&joiner).expect("remove"));
        assert_eq!(engine.validator_count().expect("count"), 2);
    }

    struct FixedStake(bool);
    impl StakeChecker for FixedStake {
        fn has_stake(&self, _pubkey: &[u8; PUBKEY_LEN]) -> Result<bool, StorageError> {
            Ok(self.0)
        }
    }

    #[test]
    fn stake_gate_applies_to_non_genesis_signers_only() {
        let keys = keypairs(2);
        let engine = engine_with(&keys, 5);
        engine
            .set_stake_checker(Arc::new(FixedStake(false)))
            .expect("checker");

        // genesis validator passes without stake
        let genesis_pk = engine.slot_validator(0).expect("slot");
        let genesis_key = keys
            .iter()
            .find(|k| k.public_key() == genesis_pk)
            .expect("present");
        let mut header = header_at(0, DIFF_IN_TURN);
        seal_header(&mut header, genesis_key);
        engine.verify_header(&header).expect("genesis exempt");

        // admitted validator without stake is rejected
        let joiner = Keypair::generate();
        engine.add_validator(joiner.public_key()).expect("add");
        let ts = {
            // find a slot owned by the joiner so difficulty derivation is
            // deterministic for the assertion below
            let mut ts = 0;
            while engine.slot_validator(ts).expect("slot") != joiner.public_key() {
                ts += 5;
            }
            ts
        };
        let mut header = header_at(ts, DIFF_IN_TURN);
        seal_header(&mut header, &joiner);
        assert!(matches!(
            engine.verify_header(&header),
            Err(PoaError::InsufficientStake)
        ));
    }
}
