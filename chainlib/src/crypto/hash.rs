//! BLAKE3 hashing and address derivation.

use crate::types::{Address, Hash};

/// BLAKE3 digest of arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Address of a compressed public key: first 20 bytes of its BLAKE3 hash.
pub fn pubkey_to_address(pubkey: &[u8]) -> Address {
    let digest = blake3::hash(pubkey);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest.as_bytes()[..20]);
    address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_hash_prefix() {
        let pubkey = [0x02u8; 33];
        let address = pubkey_to_address(&pubkey);
        assert_eq!(&address[..], &hash_bytes(&pubkey)[..20]);
    }

    #[test]
    fn distinct_keys_distinct_addresses() {
        assert_ne!(pubkey_to_address(&[0x02u8; 33]), pubkey_to_address(&[0x03u8; 33]));
    }
}
