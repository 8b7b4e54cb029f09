pub mod block;
pub mod transaction;

pub use block::{check_block_structure, BlockPolicy, BlockValidationError};
pub use transaction::{
    check_stake_outputs, check_token_rules, check_transaction, validate_with_utxos, TxPolicy,
    TxValidationError, ValidatedTx,
};
