use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::hash::hash_bytes;
use crate::types::{Hash, ZERO_HASH};

/// Reference to one output of a previous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Hash of the transaction that created the output
    pub txid: Hash,
    /// Index of the output within that transaction
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// Both fields zero marks the coinbase input.
    pub fn is_zero(&self) -> bool {
        self.txid == ZERO_HASH && self.vout == 0
    }

    /// Fixed-width key encoding used by the UTXO store.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.vout.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&key[32..]);
        Some(Self {
            txid,
            vout: u32::from_be_bytes(vout),
        })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// Output locking discipline. The numeric tags are part of the signing-bytes
/// format and must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    /// Pay to the BLAKE3-derived 20-byte address of a public key
    P2pkh = 0,
    /// Token issuance marker
    Mint = 1,
    /// Validator stake bond; data is the exact 33-byte compressed pubkey
    Stake = 2,
    /// Validator registration record; unspendable
    Register = 3,
    /// Data anchor; unspendable
    Anchor = 4,
    /// Provable coin destruction; unspendable
    Burn = 5,
}

impl ScriptType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Spending condition attached to an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub script_type: ScriptType,
    pub data: Vec<u8>,
}

impl Script {
    pub fn pay_to_address(address: &[u8; 20]) -> Self {
        Self {
            script_type: ScriptType::P2pkh,
            data: address.to_vec(),
        }
    }

    pub fn stake(pubkey: &[u8; 33]) -> Self {
        Self {
            script_type: ScriptType::Stake,
            data: pubkey.to_vec(),
        }
    }

    /// Register, Anchor and Burn outputs can never be spent.
    pub fn is_spendable(&self) -> bool {
        !matches!(
            self.script_type,
            ScriptType::Register | ScriptType::Anchor | ScriptType::Burn
        )
    }
}

/// Token quantity carried by an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// 32-byte token identifier
    pub id: Hash,
    /// Amount in base token units
    pub amount: u64,
}

/// A new output created by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in base currency units
    pub value: u64,
    /// Spending condition
    pub script: Script,
    /// Optional token payload
    pub token: Option<TokenData>,
}

/// An input spending a previous output.
///
/// The coinbase input has a zero outpoint; its `signature` field carries
/// the coinbase extra-data (block height) instead of a Schnorr signature,
/// which keeps every coinbase transaction hash unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_out: OutPoint,
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
}

impl TxInput {
    pub fn is_coinbase(&self) -> bool {
        self.prev_out.is_zero()
    }
}

/// A transfer of value between outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u64,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: crate::types::TX_VERSION,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Build the coinbase transaction for a block. The height rides in the
    /// input's signature field so coinbases at different heights never
    /// collide on hash.
    pub fn coinbase(height: u64, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: crate::types::TX_VERSION,
            inputs: vec![TxInput {
                prev_out: OutPoint::new(ZERO_HASH, 0),
                signature: height.to_le_bytes().to_vec(),
                pubkey: Vec::new(),
            }],
            outputs,
            lock_time: 0,
        }
    }

    /// A transaction is the coinbase iff its single input has the zero
    /// outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Canonical signing bytes. This is the authoritative hashed
    /// representation: signatures and pubkeys are excluded, coinbase
    /// extra-data is included, all integers little-endian, variable-length
    /// fields length-prefixed.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            buf.extend_from_slice(&input.prev_out.txid);
            buf.extend_from_slice(&input.prev_out.vout.to_le_bytes());
            if input.prev_out.is_zero() {
                buf.extend_from_slice(&(input.signature.len() as u32).to_le_bytes());
                buf.extend_from_slice(&input.signature);
            }
        }
        buf.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            buf.push(output.script.script_type.as_u8());
            buf.extend_from_slice(&(output.script.data.len() as u32).to_le_bytes());
            buf.extend_from_slice(&output.script.data);
            match &output.token {
                Some(token) => {
                    buf.push(1);
                    buf.extend_from_slice(&token.id);
                    buf.extend_from_slice(&token.amount.to_le_bytes());
                }
                None => buf.push(0),
            }
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Transaction identity: BLAKE3 of the canonical signing bytes.
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.signing_bytes())
    }

    /// Sum of output values; `None` on overflow.
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction::new(
            vec![TxInput {
                prev_out: OutPoint::new([7u8; 32], 1),
                signature: vec![0xaa; 64],
                pubkey: vec![0x02; 33],
            }],
            vec![TxOutput {
                value: 5_000,
                script: Script::pay_to_address(&[9u8; 20]),
                token: None,
            }],
        )
    }

    #[test]
    fn hash_excludes_signatures() {
        let tx = sample_tx();
        let mut resigned = tx.clone();
        resigned.inputs[0].signature = vec![0xbb; 64];
        resigned.inputs[0].pubkey = vec![0x03; 33];
        assert_eq!(tx.hash(), resigned.hash());
    }

    #[test]
    fn coinbase_hash_includes_extra_data() {
        let out = vec![TxOutput {
            value: 50,
            script: Script::pay_to_address(&[1u8; 20]),
            token: None,
        }];
        let a = Transaction::coinbase(1, out.clone());
        let b = Transaction::coinbase(2, out);
        assert!(a.is_coinbase() && b.is_coinbase());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn hash_stable_under_bincode_round_trip() {
        let tx = sample_tx();
        let bytes = bincode::serialize(&tx).expect("serialize");
        let back: Transaction = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(tx.hash(), back.hash());
    }

    #[test]
    fn token_presence_changes_hash() {
        let mut tx = sample_tx();
        let plain = tx.hash();
        tx.outputs[0].token = Some(TokenData {
            id: [3u8; 32],
            amount: 10,
        });
        assert_ne!(plain, tx.hash());
    }

    #[test]
    fn outpoint_key_round_trip() {
        let op = OutPoint::new([0xde; 32], 7);
        assert_eq!(OutPoint::from_key(&op.to_key()), Some(op));
        assert!(OutPoint::new(ZERO_HASH, 0).is_zero());
        assert!(!OutPoint::new(ZERO_HASH, 1).is_zero());
    }

    #[test]
    fn total_output_overflow_detected() {
        let mut tx = sample_tx();
        tx.outputs.push(TxOutput {
            value: u64::MAX,
            script: Script::pay_to_address(&[9u8; 20]),
            token: None,
        });
        assert_eq!(tx.total_output(), None);
    }
}
