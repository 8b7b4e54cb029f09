//! BIP340 Schnorr signatures over secp256k1.
//!
//! Validator identity is the 33-byte compressed public key; verification
//! converts to the x-only form the Schnorr scheme operates on. Schnorr has
//! no signer recovery, so callers that need the signer iterate candidate
//! keys.

use secp256k1::schnorr::Signature;
use secp256k1::{KeyPair, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use thiserror::Error;

use crate::types::Hash;

/// Compressed secp256k1 public key length.
pub const PUBKEY_LEN: usize = 33;

/// BIP340 Schnorr signature length.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("invalid secret key")]
    InvalidSecretKey,
}

/// A signing identity: secret key plus cached compressed public key.
#[derive(Clone)]
pub struct Keypair {
    inner: KeyPair,
    public: [u8; PUBKEY_LEN],
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let inner = KeyPair::from_secret_key(&secp, &secret);
        let public = PublicKey::from_keypair(&inner).serialize();
        Self { inner, public }
    }

    /// Load a keypair from 32 secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let secp = Secp256k1::new();
        let secret =
            SecretKey::from_slice(bytes).map_err(|_| SignatureError::InvalidSecretKey)?;
        let inner = KeyPair::from_secret_key(&secp, &secret);
        let public = PublicKey::from_keypair(&inner).serialize();
        Ok(Self { inner, public })
    }

    pub fn public_key(&self) -> [u8; PUBKEY_LEN] {
        self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.inner.secret_bytes()
    }

    /// Schnorr-sign a 32-byte message digest.
    pub fn sign(&self, msg: &Hash) -> [u8; SIGNATURE_LEN] {
        let secp = Secp256k1::new();
        // a 32-byte digest is always a valid message
        let message = Message::from_slice(msg).expect("digest is 32 bytes");
        let sig = secp.sign_schnorr_no_aux_rand(&message, &self.inner);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(sig.as_ref());
        out
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish()
    }
}

/// Verify a Schnorr signature against a compressed public key and a
/// 32-byte digest. Malformed keys or signatures are errors; a well-formed
/// signature that does not match returns `Ok(false)`.
pub fn verify_schnorr(pubkey: &[u8], msg: &Hash, sig: &[u8]) -> Result<bool, SignatureError> {
    if pubkey.len() != PUBKEY_LEN {
        return Err(SignatureError::InvalidKey(format!(
            "expected {} bytes, got {}",
            PUBKEY_LEN,
            pubkey.len()
        )));
    }
    let public = PublicKey::from_slice(pubkey)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_slice(sig)
        .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
    let (xonly, _parity): (XOnlyPublicKey, _) = public.x_only_public_key();

    let secp = Secp256k1::verification_only();
    let message = Message::from_slice(msg)
        .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
    Ok(secp.verify_schnorr(&signature, &message, &xonly).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::hash_bytes;

    #[test]
    fn sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let msg = hash_bytes(b"meridian header");
        let sig = keypair.sign(&msg);
        assert!(verify_schnorr(&keypair.public_key(), &msg, &sig).expect("verify"));
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let msg = hash_bytes(b"payload");
        let sig = signer.sign(&msg);
        assert!(!verify_schnorr(&other.public_key(), &msg, &sig).expect("verify"));
    }

    #[test]
    fn tampered_message_does_not_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(&hash_bytes(b"original"));
        let tampered = hash_bytes(b"tampered");
        assert!(!verify_schnorr(&keypair.public_key(), &tampered, &sig).expect("verify"));
    }

    #[test]
    fn malformed_inputs_are_errors() {
        let keypair = Keypair::generate();
        let msg = hash_bytes(b"m");
        let sig = keypair.sign(&msg);
        assert!(verify_schnorr(&[0u8; 10], &msg, &sig).is_err());
        assert!(verify_schnorr(&keypair.public_key(), &msg, &[0u8; 10]).is_err());
    }

    #[test]
    fn secret_bytes_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&keypair.secret_bytes()).expect("restore");
        assert_eq!(keypair.public_key(), restored.public_key());
    }
}
