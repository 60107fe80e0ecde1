//! Hash primitives for ZForge.
//!
//! BitcoinZ couples two hash families: BLAKE2b feeds the Equihash puzzle
//! (see [`blake2b`]), and double SHA-256 ("wsha256") produces the block hash
//! that is compared against the difficulty target.

use sha2::{Digest, Sha256};

use crate::codec::U256;

pub mod blake2b;

/// SHA-256 of a byte range. The digest bytes are stored as-is; downstream
/// comparisons treat them as a little-endian 256-bit integer, which is the
/// Bitcoin-family convention for block hashes.
pub fn sha256(data: &[u8]) -> U256 {
    let digest = Sha256::digest(data);
    U256(digest.into())
}

/// Double SHA-256, the block proof-of-work hash.
pub fn wsha256(data: &[u8]) -> U256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    U256(second.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty() {
        // FIPS 180-4 vector
        let expected = U256::from_hex_le(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();
        assert_eq!(sha256(b""), expected);
    }

    #[test]
    fn test_sha256_abc() {
        let expected = U256::from_hex_le(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert_eq!(sha256(b"abc"), expected);
    }

    #[test]
    fn test_wsha256_is_sha256_of_sha256() {
        let data = b"zforge double hash";
        let inner = sha256(data);
        assert_eq!(wsha256(data), sha256(&inner.0));
        assert_ne!(wsha256(data), sha256(data));
    }
}
