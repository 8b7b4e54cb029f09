//! Property-style invariants over the core data structures.

use proptest::prelude::*;

use chainlib::consensus::PoaEngine;
use chainlib::test_utils::test_keypair;
use chainlib::types::transaction::{
    Script, ScriptType, TokenData, Transaction, TxInput, TxOutput,
};
use chainlib::types::{compute_merkle_root, OutPoint};

fn arb_script_type() -> impl Strategy<Value = ScriptType> {
    prop_oneof![
        Just(ScriptType::P2pkh),
        Just(ScriptType::Mint),
        Just(ScriptType::Stake),
        Just(ScriptType::Register),
        Just(ScriptType::Anchor),
        Just(ScriptType::Burn),
    ]
}

fn arb_output() -> impl Strategy<Value = TxOutput> {
    (
        0u64..=u64::MAX / 1_024,
        arb_script_type(),
        proptest::collection::vec(any::<u8>(), 0..64),
        proptest::option::of((any::<[u8; 32]>(), any::<u64>())),
    )
        .prop_map(|(value, script_type, data, token)| TxOutput {
            value,
            script: Script { script_type, data },
            token: token.map(|(id, amount)| TokenData { id, amount }),
        })
}

fn arb_input() -> impl Strategy<Value = TxInput> {
    (
        any::<[u8; 32]>(),
        any::<u32>(),
        proptest::collection::vec(any::<u8>(), 0..80),
        proptest::collection::vec(any::<u8>(), 0..40),
    )
        .prop_map(|(txid, vout, signature, pubkey)| TxInput {
            prev_out: OutPoint::new(txid, vout),
            signature,
            pubkey,
        })
}

fn arb_transaction() -> impl Strategy<Value = Transaction> {
    (
        proptest::collection::vec(arb_input(), 1..8),
        proptest::collection::vec(arb_output(), 1..8),
        any::<u64>(),
    )
        .prop_map(|(inputs, outputs, lock_time)| {
            let mut tx = Transaction::new(inputs, outputs);
            tx.lock_time = lock_time;
            tx
        })
}

proptest! {
    /// Transaction identity survives serialization and ignores witnesses.
    #[test]
    fn tx_hash_stable_under_bincode(tx in arb_transaction()) {
        let bytes = bincode::serialize(&tx).expect("serialize");
        let back: Transaction = bincode::deserialize(&bytes).expect("deserialize");
        prop_assert_eq!(tx.hash(), back.hash());

        // mutating a non-coinbase witness never changes identity
        let mut mutated = tx.clone();
        let mut changed = false;
        for input in mutated.inputs.iter_mut() {
            if !input.prev_out.is_zero() {
                input.signature = vec![0xfe; 64];
                input.pubkey = vec![0x02; 33];
                changed = true;
            }
        }
        if changed {
            prop_assert_eq!(tx.hash(), mutated.hash());
        }
    }

    /// Slot election is independent of the order validators are supplied.
    #[test]
    fn slot_election_order_invariant(
        indices in proptest::sample::subsequence((1u8..=16).collect::<Vec<_>>(), 2..8),
        ts in 0u64..1_000_000,
    ) {
        let keys: Vec<[u8; 33]> = indices
            .iter()
            .map(|seed| test_keypair(*seed).public_key())
            .collect();
        let mut reversed = keys.clone();
        reversed.reverse();
        let mut rotated = keys.clone();
        rotated.rotate_left(1);

        let a = PoaEngine::new(keys, 5).expect("engine");
        let b = PoaEngine::new(reversed, 5).expect("engine");
        let c = PoaEngine::new(rotated, 5).expect("engine");
        let slot = a.slot_validator(ts).expect("slot");
        prop_assert_eq!(slot, b.slot_validator(ts).expect("slot"));
        prop_assert_eq!(slot, c.slot_validator(ts).expect("slot"));
    }

    /// The merkle root over any non-empty leaf set is deterministic and
    /// sensitive to every leaf.
    #[test]
    fn merkle_root_detects_leaf_changes(
        mut leaves in proptest::collection::vec(any::<[u8; 32]>(), 1..32),
        flip in any::<proptest::sample::Index>(),
    ) {
        let root = compute_merkle_root(&leaves);
        prop_assert_eq!(root, compute_merkle_root(&leaves));

        let index = flip.index(leaves.len());
        leaves[index][0] ^= 0xff;
        prop_assert_ne!(root, compute_merkle_root(&leaves));
    }
}
