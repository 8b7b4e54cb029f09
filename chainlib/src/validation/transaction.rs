//! Transaction validation: structural rules that need no chain context,
//! and UTXO-dependent rules resolved through a [`UtxoProvider`].

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::crypto::hash::pubkey_to_address;
use crate::crypto::signature::{verify_schnorr, PUBKEY_LEN};
use crate::storage::{StorageError, Utxo, UtxoProvider};
use crate::types::transaction::{ScriptType, Transaction};
use crate::types::{Hash, OutPoint};

#[derive(Debug, Error)]
pub enum TxValidationError {
    #[error("transaction has no inputs")]
    NoInputs,

    #[error("transaction has no outputs")]
    NoOutputs,

    #[error("too many inputs: {count} > {max}")]
    TooManyInputs { count: usize, max: usize },

    #[error("too many outputs: {count} > {max}")]
    TooManyOutputs { count: usize, max: usize },

    #[error("script data of {size} bytes exceeds limit {max}")]
    ScriptDataTooLarge { size: usize, max: usize },

    #[error("duplicate outpoint {0} within transaction")]
    DuplicateOutpoint(OutPoint),

    #[error("input {0} is missing its signature or pubkey")]
    MissingWitness(u32),

    #[error("zero-value output without token data")]
    ZeroValueOutput,

    #[error("value overflow")]
    ValueOverflow,

    #[error("input not found: {0}")]
    InputNotFound(OutPoint),

    #[error("input {0} references an unspendable output")]
    UnspendableOutput(OutPoint),

    #[error("input pubkey does not satisfy the output script")]
    ScriptMismatch,

    #[error("inputs {inputs} are less than outputs {outputs}")]
    InsufficientFee { inputs: u64, outputs: u64 },

    #[error("input {0} carries an invalid signature")]
    SignatureInvalid(u32),

    #[error("token {id} outputs exceed inputs", id = hex::encode(.0))]
    TokenImbalance(Hash),

    #[error("fee {fee} below the token creation fee {required}")]
    TokenFeeTooLow { fee: u64, required: u64 },

    #[error("stake output value {got} must be exactly {required}")]
    InvalidStakeAmount { got: u64, required: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Structural bounds applied to every transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxPolicy {
    pub max_inputs: usize,
    pub max_outputs: usize,
    pub max_script_data: usize,
}

impl Default for TxPolicy {
    fn default() -> Self {
        Self {
            max_inputs: 1_024,
            max_outputs: 1_024,
            max_script_data: 256,
        }
    }
}

/// Outcome of UTXO-aware validation.
#[derive(Debug, Clone)]
pub struct ValidatedTx {
    /// Fee paid: input value minus output value
    pub fee: u64,
    /// The UTXOs consumed, in input order
    pub spent: Vec<Utxo>,
}

/// Structural checks: no UTXO access, usable on both coinbase and plain
/// transactions.
pub fn check_transaction(tx: &Transaction, policy: &TxPolicy) -> Result<(), TxValidationError> {
    if tx.inputs.is_empty() {
        return Err(TxValidationError::NoInputs);
    }
    if tx.outputs.is_empty() {
        return Err(TxValidationError::NoOutputs);
    }
    if tx.inputs.len() > policy.max_inputs {
        return Err(TxValidationError::TooManyInputs {
            count: tx.inputs.len(),
            max: policy.max_inputs,
        });
    }
    if tx.outputs.len() > policy.max_outputs {
        return Err(TxValidationError::TooManyOutputs {
            count: tx.outputs.len(),
            max: policy.max_outputs,
        });
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (index, input) in tx.inputs.iter().enumerate() {
        if !input.is_coinbase() {
            if !seen.insert(input.prev_out) {
                return Err(TxValidationError::DuplicateOutpoint(input.prev_out));
            }
            if input.signature.is_empty() || input.pubkey.is_empty() {
                return Err(TxValidationError::MissingWitness(index as u32));
            }
        }
    }

    let coinbase = tx.is_coinbase();
    for output in &tx.outputs {
        if output.script.data.len() > policy.max_script_data {
            return Err(TxValidationError::ScriptDataTooLarge {
                size: output.script.data.len(),
                max: policy.max_script_data,
            });
        }
        // a coinbase at the supply cap legitimately pays out nothing
        if output.value == 0 && output.token.is_none() && !coinbase {
            return Err(TxValidationError::ZeroValueOutput);
        }
    }

    tx.total_output().ok_or(TxValidationError::ValueOverflow)?;
    Ok(())
}

/// Full validation of a non-coinbase transaction against the UTXO set:
/// structural rules, input existence and spendability, script binding,
/// overflow-safe fee computation, and a Schnorr signature per input.
pub fn validate_with_utxos(
    tx: &Transaction,
    provider: &dyn UtxoProvider,
    policy: &TxPolicy,
) -> Result<ValidatedTx, TxValidationError> {
    check_transaction(tx, policy)?;

    let msg = tx.hash();
    let mut spent = Vec::with_capacity(tx.inputs.len());
    let mut input_total: u64 = 0;

    for (index, input) in tx.inputs.iter().enumerate() {
        if input.is_coinbase() {
            continue;
        }
        let utxo = provider
            .utxo(&input.prev_out)?
            .ok_or(TxValidationError::InputNotFound(input.prev_out))?;

        if !utxo.script.is_spendable() {
            return Err(TxValidationError::UnspendableOutput(input.prev_out));
        }
        match utxo.script.script_type {
            ScriptType::P2pkh => {
                if pubkey_to_address(&input.pubkey)[..] != utxo.script.data[..] {
                    return Err(TxValidationError::ScriptMismatch);
                }
            }
            ScriptType::Stake => {
                if input.pubkey.len() != PUBKEY_LEN || input.pubkey[..] != utxo.script.data[..] {
                    return Err(TxValidationError::ScriptMismatch);
                }
            }
            // Mint outputs bind to a key like P2PKH does
            ScriptType::Mint => {
                if pubkey_to_address(&input.pubkey)[..] != utxo.script.data[..] {
                    return Err(TxValidationError::ScriptMismatch);
                }
            }
            ScriptType::Register | ScriptType::Anchor | ScriptType::Burn => {
                return Err(TxValidationError::UnspendableOutput(input.prev_out));
            }
        }

        if !verify_schnorr(&input.pubkey, &msg, &input.signature).unwrap_or(false) {
            return Err(TxValidationError::SignatureInvalid(index as u32));
        }

        input_total = input_total
            .checked_add(utxo.value)
            .ok_or(TxValidationError::ValueOverflow)?;
        spent.push(utxo);
    }

    let output_total = tx.total_output().ok_or(TxValidationError::ValueOverflow)?;
    let fee = input_total
        .checked_sub(output_total)
        .ok_or(TxValidationError::InsufficientFee {
            inputs: input_total,
            outputs: output_total,
        })?;

    Ok(ValidatedTx { fee, spent })
}

/// Per-transaction token conservation. For every token id the outputs may
/// not exceed the inputs (burning by under-spending is allowed) unless the
/// id is introduced by a Mint output in this transaction. A transaction
/// that mints must pay at least the token creation fee.
pub fn check_token_rules(
    tx: &Transaction,
    spent: &[Utxo],
    fee: u64,
    token_creation_fee: u64,
) -> Result<(), TxValidationError> {
    let mut inputs_by_id: HashMap<Hash, u64> = HashMap::new();
    for utxo in spent {
        if let Some(token) = &utxo.token {
            let entry = inputs_by_id.entry(token.id).or_insert(0);
            *entry = entry
                .checked_add(token.amount)
                .ok_or(TxValidationError::ValueOverflow)?;
        }
    }

    let mut outputs_by_id: HashMap<Hash, u64> = HashMap::new();
    let mut minted_ids: HashSet<Hash> = HashSet::new();
    let mut has_mint_output = false;
    for output in &tx.outputs {
        if output.script.script_type == ScriptType::Mint {
            has_mint_output = true;
            if let Some(token) = &output.token {
                minted_ids.insert(token.id);
            }
        }
        if let Some(token) = &output.token {
            let entry = outputs_by_id.entry(token.id).or_insert(0);
            *entry = entry
                .checked_add(token.amount)
                .ok_or(TxValidationError::ValueOverflow)?;
        }
    }

    for (id, out_amount) in &outputs_by_id {
        if minted_ids.contains(id) {
            continue;
        }
        let in_amount = inputs_by_id.get(id).copied().unwrap_or(0);
        if *out_amount > in_amount {
            return Err(TxValidationError::TokenImbalance(*id));
        }
    }

    if has_mint_output && fee < token_creation_fee {
        return Err(TxValidationError::TokenFeeTooLow {
            fee,
            required: token_creation_fee,
        });
    }
    Ok(())
}

/// Every Stake output must bond exactly the configured amount.
/// `required = 0` disables the check.
pub fn check_stake_outputs(tx: &Transaction, required: u64) -> Result<(), TxValidationError> {
    if required == 0 {
        return Ok(());
    }
    for output in &tx.outputs {
        if output.script.script_type == ScriptType::Stake && output.value != required {
            return Err(TxValidationError::InvalidStakeAmount {
                got: output.value,
                required,
            });
        }
    }
    Ok(())
}
