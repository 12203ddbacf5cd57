//! Boundary formats: datagrams, the in-transit wire envelope, invite links.
//!
//! A datagram is `transit_key_id(32) ‖ transit_ct`. Inside the transit layer
//! sits a wire envelope: either a plain signed event, an event encrypted
//! under a group key, or an event sealed to one recipient.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use quiet_core::{EventId, KeyId, ID_LEN};
use quiet_crypto::{SealPublicKey, SymmetricKey};

use crate::envelope::b64;
use crate::{ProtocolError, ProtocolResult};

/// KDF domain for the invite-proof signing keypair.
pub const INVITE_KDF_INFO: &str = "quiet/invite";
/// KDF domain for the invite-bootstrap transit key.
pub const INVITE_TRANSIT_KDF_INFO: &str = "quiet/invite-transit";
/// Invite link scheme prefix.
pub const INVITE_SCHEME: &str = "quiet://invite/";
/// Invite secrets are 32 random bytes.
pub const INVITE_SECRET_LEN: usize = 32;

/// The canonical event wrapper carried inside the transit layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireEnvelope {
    /// Event encrypted under a shared group key.
    GroupEncrypted {
        group_key_id: KeyId,
        #[serde(with = "b64")]
        event_ct: Vec<u8>,
    },
    /// Event sealed to a single recipient.
    Sealed {
        seal_to: SealPublicKey,
        #[serde(with = "b64")]
        sealed: Vec<u8>,
    },
    /// Plain signed event (canonical bytes).
    Plain {
        #[serde(with = "b64")]
        event: Vec<u8>,
    },
}

impl WireEnvelope {
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

/// Wrap a wire envelope for the transport: `transit_key_id ‖ transit_ct`.
pub fn encode_datagram(
    transit_key: &SymmetricKey,
    wire: &WireEnvelope,
) -> ProtocolResult<Vec<u8>> {
    let plaintext = wire.to_bytes()?;
    let ct = quiet_crypto::encrypt(transit_key, &plaintext)?;
    let key_id = transit_key.id();

    let mut out = Vec::with_capacity(ID_LEN + ct.len());
    out.extend_from_slice(key_id.as_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Split a datagram into its transit key id and ciphertext.
pub fn split_datagram(bytes: &[u8]) -> ProtocolResult<(KeyId, &[u8])> {
    if bytes.len() <= ID_LEN {
        return Err(ProtocolError::malformed(format!(
            "datagram too short: {} bytes",
            bytes.len()
        )));
    }
    let (id_bytes, ct) = bytes.split_at(ID_LEN);
    let key_id = KeyId::from_slice(id_bytes)
        .map_err(|e| ProtocolError::malformed(format!("transit key id: {e}")))?;
    Ok((key_id, ct))
}

/// A parsed `quiet://invite/…` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub network_id: EventId,
    /// The group the invite admits to; the network's default group has
    /// `group_id == network_id`.
    pub group_id: EventId,
    pub secret: Vec<u8>,
}

impl InviteLink {
    pub fn encode(&self) -> String {
        let mut packed = Vec::with_capacity(ID_LEN * 2 + self.secret.len());
        packed.extend_from_slice(self.network_id.as_bytes());
        packed.extend_from_slice(self.group_id.as_bytes());
        packed.extend_from_slice(&self.secret);
        format!("{INVITE_SCHEME}{}", URL_SAFE_NO_PAD.encode(packed))
    }

    pub fn parse(link: &str) -> ProtocolResult<Self> {
        let encoded = link
            .strip_prefix(INVITE_SCHEME)
            .ok_or_else(|| ProtocolError::malformed("invite link missing quiet:// scheme"))?;
        let packed = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| ProtocolError::malformed(format!("invite link: {e}")))?;
        if packed.len() != ID_LEN * 2 + INVITE_SECRET_LEN {
            return Err(ProtocolError::malformed(format!(
                "invite link payload has {} bytes",
                packed.len()
            )));
        }
        let network_id = EventId::from_slice(&packed[..ID_LEN])
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;
        let group_id = EventId::from_slice(&packed[ID_LEN..ID_LEN * 2])
            .map_err(|e| ProtocolError::malformed(e.to_string()))?;
        Ok(Self {
            network_id,
            group_id,
            secret: packed[ID_LEN * 2..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trip() {
        let key = SymmetricKey::generate();
        let wire = WireEnvelope::Plain {
            event: b"{\"event_type\":\"message\"}".to_vec(),
        };
        let datagram = encode_datagram(&key, &wire).unwrap();

        let (key_id, ct) = split_datagram(&datagram).unwrap();
        assert_eq!(key_id, key.id());
        let plaintext = quiet_crypto::decrypt(&key, ct).unwrap();
        assert_eq!(WireEnvelope::from_bytes(&plaintext).unwrap(), wire);
    }

    #[test]
    fn wire_envelope_variants_round_trip() {
        let sealed = WireEnvelope::Sealed {
            seal_to: quiet_crypto::Keypair::generate().seal_public().unwrap(),
            sealed: vec![1, 2, 3],
        };
        let bytes = sealed.to_bytes().unwrap();
        assert_eq!(WireEnvelope::from_bytes(&bytes).unwrap(), sealed);

        let grouped = WireEnvelope::GroupEncrypted {
            group_key_id: SymmetricKey::generate().id(),
            event_ct: vec![4, 5],
        };
        let bytes = grouped.to_bytes().unwrap();
        assert_eq!(WireEnvelope::from_bytes(&bytes).unwrap(), grouped);
    }

    #[test]
    fn invite_link_round_trip() {
        let link = InviteLink {
            network_id: EventId::from_bytes([1u8; 32]),
            group_id: EventId::from_bytes([2u8; 32]),
            secret: vec![7u8; INVITE_SECRET_LEN],
        };
        let encoded = link.encode();
        assert!(encoded.starts_with(INVITE_SCHEME));
        assert_eq!(InviteLink::parse(&encoded).unwrap(), link);
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert!(split_datagram(&[0u8; 16]).is_err());
    }

    #[test]
    fn bad_scheme_is_malformed() {
        assert!(InviteLink::parse("https://example.com/x").is_err());
    }
}
