//! Key material: signing identities, sealing keys, symmetric keys.

use core::fmt;
use core::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::StaticSecret;

use quiet_core::KeyId;

use crate::hash::sha256;
use crate::{CryptoError, CryptoResult};

/// Domain-separation label for deriving the X25519 sealing secret from an
/// Ed25519 identity secret. The identity holds one 32-byte secret; the
/// sealing half is always derived, never stored.
const SEAL_DERIVE_INFO: &[u8] = b"quiet/seal-key-v1";

macro_rules! impl_key_newtype {
    ($t:ty, $name:literal, $len:expr) => {
        impl $t {
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    CryptoError::WrongKey(format!(
                        "{}: expected {} bytes, got {}",
                        $name,
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($name, "({}…)"), hex::encode(&self.0[..4]))
            }
        }

        impl FromStr for $t {
            type Err = CryptoError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)
                    .map_err(|e| CryptoError::WrongKey(format!("{}: {}", $name, e)))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(|e: CryptoError| D::Error::custom(e))
            }
        }
    };
}

/// Ed25519 verifying key of a signer, hex at boundaries.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

/// X25519 public key messages are sealed to.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealPublicKey([u8; 32]);

impl_key_newtype!(PublicKey, "PublicKey", 32);
impl_key_newtype!(SealPublicKey, "SealPublicKey", 32);

impl PublicKey {
    pub(crate) fn to_verifying_key(self) -> CryptoResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::WrongKey(format!("not a valid Ed25519 point: {e}")))
    }
}

/// A signing identity: one 32-byte Ed25519 secret, from which the X25519
/// sealing secret is derived on demand.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret bytes stay out of logs.
        write!(f, "Keypair({:?})", self.public())
    }
}

impl Keypair {
    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a stored 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = secret.try_into().map_err(|_| {
            CryptoError::WrongKey(format!("secret: expected 32 bytes, got {}", secret.len()))
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(&arr),
        })
    }

    /// The 32-byte secret for persistence (local identities table only).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Derived X25519 secret for opening sealed messages.
    pub(crate) fn sealing_secret(&self) -> CryptoResult<StaticSecret> {
        let hk = Hkdf::<Sha256>::new(None, &self.secret_bytes());
        let mut okm = [0u8; 32];
        hk.expand(SEAL_DERIVE_INFO, &mut okm)
            .map_err(|e| CryptoError::WrongKey(format!("seal derive: {e}")))?;
        Ok(StaticSecret::from(okm))
    }

    /// The sealing public key peers use to `seal_to` this identity.
    /// Advertised in user/peer payloads alongside the signing key.
    pub fn seal_public(&self) -> CryptoResult<SealPublicKey> {
        let secret = self.sealing_secret()?;
        Ok(SealPublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes()))
    }
}

/// 32-byte ChaCha20-Poly1305 key (group keys, transit keys).
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", self.id())
    }
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::WrongKey(format!("key: expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Content-addressed identity of this key: the hash of its bytes.
    /// Safe to reference anywhere; the bytes themselves are not recoverable.
    pub fn id(&self) -> KeyId {
        KeyId::from_bytes(sha256(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_secret_bytes() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public(), restored.public());
        assert_eq!(kp.seal_public().unwrap(), restored.seal_public().unwrap());
    }

    #[test]
    fn seal_public_is_deterministic() {
        let kp = Keypair::generate();
        assert_eq!(kp.seal_public().unwrap(), kp.seal_public().unwrap());
    }

    #[test]
    fn symmetric_key_id_is_stable() {
        let key = SymmetricKey::generate();
        assert_eq!(key.id(), SymmetricKey::from_bytes(*key.as_bytes()).id());
    }

    #[test]
    fn public_key_hex_round_trip() {
        let kp = Keypair::generate();
        let parsed: PublicKey = kp.public().to_hex().parse().unwrap();
        assert_eq!(kp.public(), parsed);
    }
}
