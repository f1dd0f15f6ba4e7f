use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha2::Sha256;

use prisma_core::constants::ADDRESS_SUFFIX;
use prisma_core::error::PrismaError;
use prisma_core::types::Address;

/// BLAKE2b with a 32-byte digest, rendered as 64 hex characters.
type Blake2b256 = Blake2b<U32>;

/// Hash for event ids and state hashes.
pub fn hash_event(bytes: &[u8]) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256, used for transaction identifiers and node ids.
pub fn hash_tx(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Transaction identifier: big-endian integer of the first 10 digest bytes.
pub fn tx_id(tx_hex: &str) -> u128 {
    let digest = hash_tx(tx_hex.as_bytes());
    let mut buf = [0u8; 16];
    buf[6..].copy_from_slice(&digest[..10]);
    u128::from_be_bytes(buf)
}

/// Derive the wallet address from a hex-encoded verify key.
///
/// The address integer is built from the first 8 ASCII bytes of the *hex*
/// encoding (not the raw key), big-endian. This mapping is part of the wire
/// format and must stay bit-exact.
pub fn address_from_verify_key(verify_key_hex: &str) -> Result<Address, PrismaError> {
    let ascii = verify_key_hex.as_bytes();
    if ascii.len() < 8 {
        return Err(PrismaError::InvalidPublicKey);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&ascii[..8]);
    Ok(format!("{}{}", u64::from_be_bytes(buf), ADDRESS_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_hash_is_64_hex_chars() {
        let h = hash_event(b"prisma");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn event_hash_is_deterministic() {
        assert_eq!(hash_event(b"a"), hash_event(b"a"));
        assert_ne!(hash_event(b"a"), hash_event(b"b"));
    }

    // The genesis fixtures pin the exact mapping: the address integer is the
    // big-endian u64 of the first 8 hex characters' ASCII bytes.
    #[test]
    fn address_matches_genesis_vectors() {
        assert_eq!(
            address_from_verify_key("6bfb2092aaaaaaaa").unwrap(),
            "3918807197700602162PR"
        );
        assert_eq!(
            address_from_verify_key("1b36699b00000000").unwrap(),
            "3558462963507083618PR"
        );
        assert_eq!(
            address_from_verify_key("ef864873ffffffff").unwrap(),
            "7306589250910697267PR"
        );
    }

    #[test]
    fn short_key_rejected() {
        assert!(address_from_verify_key("abc").is_err());
    }

    #[test]
    fn tx_ids_differ_per_payload() {
        assert_ne!(tx_id("00aa"), tx_id("00ab"));
    }
}
