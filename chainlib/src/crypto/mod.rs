pub mod hash;
pub mod signature;

pub use hash::{hash_bytes, pubkey_to_address};
pub use signature::{verify_schnorr, Keypair, SignatureError, PUBKEY_LEN, SIGNATURE_LEN};
