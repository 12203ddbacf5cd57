//! Detached Ed25519 signatures.

use core::fmt;
use core::str::FromStr;

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::keys::{Keypair, PublicKey};
use crate::{CryptoError, CryptoResult};

/// A 64-byte detached signature, hex at boundaries.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::MalformedCiphertext(format!(
                "signature: expected 64 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for Signature {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s).map_err(|e| CryptoError::MalformedCiphertext(format!("signature: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: CryptoError| D::Error::custom(e))
    }
}

/// Sign `msg` with the identity's Ed25519 key.
pub fn sign(keypair: &Keypair, msg: &[u8]) -> Signature {
    Signature(keypair.signing_key().sign(msg).to_bytes())
}

/// Verify a detached signature. Returns `false` for a valid-shaped but
/// non-matching signature; errors only when the public key itself is invalid.
pub fn verify(public: &PublicKey, msg: &[u8], signature: &Signature) -> CryptoResult<bool> {
    let verifying = public.to_verifying_key()?;
    let sig = Ed25519Signature::from_bytes(&signature.0);
    Ok(verifying.verify(msg, &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let sig = sign(&kp, b"hello");
        assert!(verify(&kp.public(), b"hello", &sig).unwrap());
    }

    #[test]
    fn wrong_message_fails() {
        let kp = Keypair::generate();
        let sig = sign(&kp, b"hello");
        assert!(!verify(&kp.public(), b"goodbye", &sig).unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign(&kp, b"hello");
        assert!(!verify(&other.public(), b"hello", &sig).unwrap());
    }

    #[test]
    fn hex_round_trip() {
        let kp = Keypair::generate();
        let sig = sign(&kp, b"payload");
        let parsed: Signature = sig.to_hex().parse().unwrap();
        assert_eq!(sig, parsed);
    }
}
