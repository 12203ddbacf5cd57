//! The immutable signed event and its canonical serialization.
//!
//! `event_id = sha256(canonical_bytes)` where `canonical_bytes` is the
//! sorted-key JSON of the full wire form including the signature. Tampering
//! with any field changes the identity. Sorted keys come from routing the
//! struct through `serde_json::Value`, whose object representation is a
//! `BTreeMap`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quiet_core::EventId;
use quiet_crypto::{sha256, Keypair, PublicKey, Signature};

use crate::{ProtocolError, ProtocolResult};

/// A signed, content-addressed event as it exists on the wire and in the
/// `events` table (`payload_blob` holds the canonical bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: JsonValue,
    #[serde(rename = "signer_pubkey")]
    pub signer: PublicKey,
    pub signature: Signature,
}

impl Event {
    /// Bytes covered by the signature: everything except the signature.
    pub fn signing_bytes(
        event_type: &str,
        payload: &JsonValue,
        signer: &PublicKey,
    ) -> ProtocolResult<Vec<u8>> {
        let value = serde_json::json!({
            "event_type": event_type,
            "payload": payload,
            "signer_pubkey": signer,
        });
        serde_json::to_vec(&value).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// Sign a payload, producing the finished event.
    pub fn sign(
        keypair: &Keypair,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> ProtocolResult<Self> {
        let event_type = event_type.into();
        let signer = keypair.public();
        let msg = Self::signing_bytes(&event_type, &payload, &signer)?;
        let signature = quiet_crypto::sign(keypair, &msg);
        Ok(Self {
            event_type,
            payload,
            signer,
            signature,
        })
    }

    /// Verify the signature against the claimed signer.
    pub fn verify_signature(&self) -> ProtocolResult<bool> {
        let msg = Self::signing_bytes(&self.event_type, &self.payload, &self.signer)?;
        Ok(quiet_crypto::verify(&self.signer, &msg, &self.signature)?)
    }

    /// Canonical sorted-key serialization, including the signature.
    pub fn canonical_bytes(&self) -> ProtocolResult<Vec<u8>> {
        let value =
            serde_json::to_value(self).map_err(|e| ProtocolError::malformed(e.to_string()))?;
        serde_json::to_vec(&value).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// The content-addressed identity.
    pub fn event_id(&self) -> ProtocolResult<EventId> {
        Ok(EventId::from_bytes(sha256(&self.canonical_bytes()?)))
    }

    /// Parse an event back out of its canonical bytes.
    pub fn from_canonical_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// The signed creation timestamp every payload carries.
    pub fn created_at_ms(&self) -> ProtocolResult<i64> {
        self.payload
            .get("created_at_ms")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| ProtocolError::malformed("payload missing created_at_ms"))
    }

    /// The network this event belongs to, when the payload names one.
    /// The `network` kind itself has none; its own id becomes the network id.
    pub fn network_id(&self) -> Option<EventId> {
        self.payload
            .get("network_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Extract a payload field that holds a hex event id.
    pub fn payload_id(&self, field: &str) -> ProtocolResult<EventId> {
        self.payload
            .get(field)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ProtocolError::malformed(format!("payload missing {field}")))?
            .parse()
            .map_err(|e| ProtocolError::malformed(format!("payload {field}: {e}")))
    }

    /// Extract a required string payload field.
    pub fn payload_str(&self, field: &str) -> ProtocolResult<&str> {
        self.payload
            .get(field)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ProtocolError::malformed(format!("payload missing {field}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Keypair, Event) {
        let kp = Keypair::generate();
        let event = Event::sign(
            &kp,
            "message",
            serde_json::json!({
                "text": "hi",
                "created_at_ms": 1_700_000_000_000i64,
            }),
        )
        .unwrap();
        (kp, event)
    }

    #[test]
    fn canonical_round_trip() {
        let (_, event) = sample();
        let bytes = event.canonical_bytes().unwrap();
        let parsed = Event::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(event, parsed);
        assert_eq!(event.event_id().unwrap(), parsed.event_id().unwrap());
    }

    #[test]
    fn signature_verifies() {
        let (_, event) = sample();
        assert!(event.verify_signature().unwrap());
    }

    #[test]
    fn tampering_changes_identity_and_breaks_signature() {
        let (_, mut event) = sample();
        let original_id = event.event_id().unwrap();
        event.payload["text"] = serde_json::json!("bye");
        assert_ne!(event.event_id().unwrap(), original_id);
        assert!(!event.verify_signature().unwrap());
    }

    #[test]
    fn canonical_bytes_are_key_sorted() {
        let (_, event) = sample();
        let bytes = event.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let et = text.find("\"event_type\"").unwrap();
        let pl = text.find("\"payload\"").unwrap();
        let sig = text.find("\"signature\"").unwrap();
        let signer = text.find("\"signer_pubkey\"").unwrap();
        assert!(et < pl && pl < sig && sig < signer);
    }

    #[test]
    fn same_content_same_id() {
        let kp = Keypair::generate();
        let payload = serde_json::json!({"text": "x", "created_at_ms": 5i64});
        let a = Event::sign(&kp, "message", payload.clone()).unwrap();
        // Ed25519 is deterministic, so re-signing identical content converges.
        let b = Event::sign(&kp, "message", payload).unwrap();
        assert_eq!(a.event_id().unwrap(), b.event_id().unwrap());
    }

    proptest::proptest! {
        /// parse(serialize(e)) == e, and the identity is the canonical hash.
        #[test]
        fn canonical_round_trip_holds_for_any_payload(
            text in ".{0,64}",
            created_at_ms in 0i64..=4_102_444_800_000,
        ) {
            let kp = Keypair::generate();
            let event = Event::sign(
                &kp,
                "message",
                serde_json::json!({ "text": text, "created_at_ms": created_at_ms }),
            )
            .unwrap();

            let bytes = event.canonical_bytes().unwrap();
            let parsed = Event::from_canonical_bytes(&bytes).unwrap();
            proptest::prop_assert_eq!(&event, &parsed);
            proptest::prop_assert_eq!(
                event.event_id().unwrap(),
                EventId::from_bytes(sha256(&bytes))
            );
            proptest::prop_assert!(parsed.verify_signature().unwrap());
        }
    }
}
