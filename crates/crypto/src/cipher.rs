//! Authenticated symmetric encryption (group keys, transit layer).
//!
//! Wire form: `nonce(12) ‖ ct`. The nonce is random per message; keys are
//! 32-byte ChaCha20-Poly1305 keys.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::keys::SymmetricKey;
use crate::{CryptoError, CryptoResult};

pub const NONCE_LEN: usize = 12;

/// Encrypt `msg` under `key`. Output: `nonce ‖ ct`.
pub fn encrypt(key: &SymmetricKey, msg: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(nonce, msg)
        .map_err(|_| CryptoError::MacFailure)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt a `nonce ‖ ct` blob under `key`.
pub fn decrypt(key: &SymmetricKey, blob: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext(format!(
            "ciphertext shorter than nonce: {} bytes",
            blob.len()
        )));
    }
    let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ct)
        .map_err(|_| CryptoError::MacFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = SymmetricKey::generate();
        let ct = encrypt(&key, b"attack at dawn").unwrap();
        assert_eq!(decrypt(&key, &ct).unwrap(), b"attack at dawn");
    }

    #[test]
    fn wrong_key_is_mac_failure() {
        let key = SymmetricKey::generate();
        let other = SymmetricKey::generate();
        let ct = encrypt(&key, b"secret").unwrap();
        assert_eq!(decrypt(&other, &ct), Err(CryptoError::MacFailure));
    }

    #[test]
    fn truncated_ciphertext_is_malformed() {
        let key = SymmetricKey::generate();
        assert!(matches!(
            decrypt(&key, &[0u8; 4]),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_is_mac_failure() {
        let key = SymmetricKey::generate();
        let mut ct = encrypt(&key, b"secret").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert_eq!(decrypt(&key, &ct), Err(CryptoError::MacFailure));
    }
}
