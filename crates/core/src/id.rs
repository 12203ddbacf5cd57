//! Strongly-typed content-addressed identifiers used across the protocol.
//!
//! Every cross-reference between records is a 32-byte hash, hex-encoded at
//! boundaries. There are no pointer graphs; an id either resolves against the
//! store or the referencing record waits in `blocked`.

use core::fmt;
use core::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Length in bytes of every content-addressed identifier.
pub const ID_LEN: usize = 32;

/// Identity of a stored event: the hash of its canonical serialization.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; ID_LEN]);

/// Identity of a symmetric key (group or transit): the hash of the key bytes.
///
/// Key material itself never appears where a `KeyId` does.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; ID_LEN]);

macro_rules! impl_hash_id {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Parse from a byte slice; the slice must be exactly 32 bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
                let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
                    CoreError::invalid_id(format!(
                        "{}: expected {} bytes, got {}",
                        $name,
                        ID_LEN,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
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
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
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
                s.parse().map_err(|e: CoreError| D::Error::custom(e))
            }
        }
    };
}

impl_hash_id!(EventId, "EventId");
impl_hash_id!(KeyId, "KeyId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = EventId::from_bytes([7u8; ID_LEN]);
        let parsed: EventId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(EventId::from_slice(&[1u8; 16]).is_err());
        assert!("abcd".parse::<EventId>().is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let id = KeyId::from_bytes([0xabu8; ID_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(ID_LEN)));
        let back: KeyId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
