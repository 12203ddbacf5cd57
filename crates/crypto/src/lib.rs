//! Cryptographic primitives for the envelope model.
//!
//! Pure functions over byte strings: signing, sealing to a peer, symmetric
//! authenticated encryption (group and transit layers), key derivation, and
//! hashing. No IO, no storage; callers own persistence of key material.

pub mod cipher;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod seal;
pub mod signature;

use thiserror::Error;

pub use cipher::{decrypt, encrypt};
pub use hash::{sha256, sha256_hex};
pub use kdf::{derive_keypair, derive_symmetric_key};
pub use keys::{Keypair, PublicKey, SealPublicKey, SymmetricKey};
pub use seal::{open_sealed, seal_to};
pub use signature::{sign, verify, Signature};

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Crypto failures. All are terminal for the envelope that hit them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A signature did not verify against the claimed signer.
    #[error("bad signature")]
    BadSignature,

    /// Authenticated decryption failed (tag mismatch).
    #[error("mac failure")]
    MacFailure,

    /// Key material had the wrong shape for the operation.
    #[error("wrong key: {0}")]
    WrongKey(String),

    /// Ciphertext was too short or otherwise unparseable.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),
}
