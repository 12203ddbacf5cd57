//! Hashing.

use sha2::{Digest, Sha256};

/// SHA-256 of `data`, the 32-byte identity primitive for events and keys.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        assert_eq!(sha256(b"quiet"), sha256(b"quiet"));
        assert_ne!(sha256(b"quiet"), sha256(b"loud"));
    }

    #[test]
    fn hex_is_64_chars() {
        assert_eq!(sha256_hex(b"x").len(), 64);
    }
}
