//! Anonymous sealed boxes: public-key encryption to a single recipient.
//!
//! Ephemeral X25519 ECDH against the recipient's sealing key, HKDF-SHA256 to
//! a one-shot ChaCha20-Poly1305 key and nonce. Wire form: `epk(32) ‖ ct`.
//! The sender keeps nothing and cannot decrypt its own output.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as XPublicKey};

use crate::cipher::NONCE_LEN;
use crate::keys::{Keypair, SealPublicKey};
use crate::{CryptoError, CryptoResult};

const SEAL_BOX_INFO: &[u8] = b"quiet/seal-box-v1";
const EPK_LEN: usize = 32;

/// Derive the one-shot key and nonce. The salt binds the ephemeral and
/// recipient public keys so a transcript can't be replayed to another key.
fn derive_box_material(
    shared: &[u8],
    epk: &[u8; 32],
    recipient: &SealPublicKey,
) -> CryptoResult<([u8; 32], [u8; NONCE_LEN])> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(epk);
    salt.extend_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 32 + NONCE_LEN];
    hk.expand(SEAL_BOX_INFO, &mut okm)
        .map_err(|e| CryptoError::WrongKey(format!("seal kdf: {e}")))?;

    let mut key = [0u8; 32];
    key.copy_from_slice(&okm[..32]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&okm[32..]);
    Ok((key, nonce))
}

/// Seal `msg` to `recipient`. Anyone can seal; only the recipient opens.
pub fn seal_to(recipient: &SealPublicKey, msg: &[u8]) -> CryptoResult<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let epk = XPublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&XPublicKey::from(*recipient.as_bytes()));

    let (key, nonce) = derive_box_material(shared.as_bytes(), &epk, recipient)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), msg)
        .map_err(|_| CryptoError::MacFailure)?;

    let mut out = Vec::with_capacity(EPK_LEN + ct.len());
    out.extend_from_slice(&epk);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed box with the identity whose sealing key it targets.
pub fn open_sealed(keypair: &Keypair, blob: &[u8]) -> CryptoResult<Vec<u8>> {
    if blob.len() < EPK_LEN {
        return Err(CryptoError::MalformedCiphertext(format!(
            "sealed box shorter than ephemeral key: {} bytes",
            blob.len()
        )));
    }
    let (epk_bytes, ct) = blob.split_at(EPK_LEN);
    let epk: [u8; 32] = epk_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedCiphertext("bad ephemeral key".into()))?;

    let recipient = keypair.seal_public()?;
    let secret = keypair.sealing_secret()?;
    let shared = secret.diffie_hellman(&XPublicKey::from(epk));

    let (key, nonce) = derive_box_material(shared.as_bytes(), &epk, &recipient)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ct)
        .map_err(|_| CryptoError::MacFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let kp = Keypair::generate();
        let sealed = seal_to(&kp.seal_public().unwrap(), b"for your eyes only").unwrap();
        assert_eq!(open_sealed(&kp, &sealed).unwrap(), b"for your eyes only");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sealed = seal_to(&kp.seal_public().unwrap(), b"secret").unwrap();
        assert_eq!(open_sealed(&other, &sealed), Err(CryptoError::MacFailure));
    }

    #[test]
    fn sealing_twice_differs() {
        // Fresh ephemeral key per box.
        let kp = Keypair::generate();
        let a = seal_to(&kp.seal_public().unwrap(), b"msg").unwrap();
        let b = seal_to(&kp.seal_public().unwrap(), b"msg").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_box_is_malformed() {
        let kp = Keypair::generate();
        assert!(matches!(
            open_sealed(&kp, &[0u8; 8]),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }
}
