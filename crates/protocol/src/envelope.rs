//! The envelope: the unit of work moving through the pipeline.
//!
//! Fields fill progressively as stages run: a raw datagram knows only its
//! transit ciphertext; by the time an envelope is projected it carries the
//! full signed event. Envelopes are ephemeral except when parked in
//! `blocked`, where the whole envelope persists as JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quiet_core::{EventId, KeyId};
use quiet_crypto::{PublicKey, SealPublicKey, Signature};

use crate::event::Event;
use crate::{ProtocolError, ProtocolResult};

/// Where an envelope entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeOrigin {
    /// Issued by `submit_command`.
    LocalCommand,
    /// Arrived over the transport via `ingest_datagram`.
    IncomingDatagram,
    /// Produced by a reflector (responses, unpacked sync payloads).
    Reflected,
    /// Produced by a scheduled job.
    Job,
}

/// Pipeline position. `Blocked` is persistent; everything else lives only
/// inside one transaction. Terminal states: `Projected`, `Dropped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    Received,
    TransitDecrypted,
    Opened,
    Validated,
    Stored,
    Projected,
    Blocked,
    Dropped,
}

/// Which key signs a locally issued envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerSpec {
    /// A local identity, looked up by its public key.
    Identity(PublicKey),
    /// A keypair derived from an invite secret (join proofs).
    InviteSecret(#[serde(with = "b64")] Vec<u8>),
}

/// Why a validator parked an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    MissingKey,
    MissingDep,
    UnknownSigner,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::MissingKey => "missing_key",
            BlockKind::MissingDep => "missing_dep",
            BlockKind::UnknownSigner => "unknown_signer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing_key" => Some(BlockKind::MissingKey),
            "missing_dep" => Some(BlockKind::MissingDep),
            "unknown_signer" => Some(BlockKind::UnknownSigner),
            _ => None,
        }
    }
}

/// A `(reason_type, reason_key)` classification of a blocked envelope. The
/// key is the hex of whatever is missing: a group key id, an event id, or a
/// signer public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockReason {
    pub kind: BlockKind,
    pub key: String,
}

impl BlockReason {
    pub fn missing_key(key_id: KeyId) -> Self {
        Self {
            kind: BlockKind::MissingKey,
            key: key_id.to_hex(),
        }
    }

    pub fn missing_dep(event_id: EventId) -> Self {
        Self {
            kind: BlockKind::MissingDep,
            key: event_id.to_hex(),
        }
    }

    pub fn unknown_signer(pubkey: &PublicKey) -> Self {
        Self {
            kind: BlockKind::UnknownSigner,
            key: pubkey.to_hex(),
        }
    }

    /// Coalescing key for the recheck queue.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.key)
    }
}

/// Why an envelope terminated without projecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// We never speak to unknown transit keys; not worth parking.
    UnknownTransitKey,
    BadSignature,
    MacFailure,
    Malformed(String),
    Invalid(String),
    /// Sealed to a recipient that is not a local identity.
    SealedToOther,
    /// Already present in `events`: the idempotent short-circuit.
    Duplicate,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::UnknownTransitKey => f.write_str("unknown transit key"),
            DropReason::BadSignature => f.write_str("bad signature"),
            DropReason::MacFailure => f.write_str("mac failure"),
            DropReason::Malformed(msg) => write!(f, "malformed: {msg}"),
            DropReason::Invalid(msg) => write!(f, "invalid: {msg}"),
            DropReason::SealedToOther => f.write_str("sealed to another recipient"),
            DropReason::Duplicate => f.write_str("duplicate"),
        }
    }
}

/// Validator verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Terminal for this envelope; retained in `unknown_events`.
    Invalid(String),
    /// Park in `blocked` until the reason clears.
    Blocked(BlockReason),
}

/// The unit of work. See module docs; field groups fill in stage order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: EnvelopeOrigin,
    pub state: EnvelopeState,

    // Transit layer (inbound only).
    #[serde(default, with = "b64_opt")]
    pub transit_ciphertext: Option<Vec<u8>>,
    pub transit_key_id: Option<KeyId>,
    pub origin_ip: Option<String>,
    pub origin_port: Option<u16>,

    // Event layer.
    #[serde(default, with = "b64_opt")]
    pub event_ciphertext: Option<Vec<u8>>,
    pub seal_to: Option<SealPublicKey>,
    pub group_key_id: Option<KeyId>,
    pub event_type: Option<String>,
    pub event_plaintext: Option<JsonValue>,
    pub event_id: Option<EventId>,
    pub signer: Option<PublicKey>,
    pub signature: Option<Signature>,

    /// Event ids this event requires before it may validate.
    #[serde(default)]
    pub deps: Vec<EventId>,

    /// Unresolved `@generated:<type>:<index>` references, bookkeeping for
    /// multi-event commands.
    #[serde(default)]
    pub placeholders: Vec<String>,

    // Outbound routing.
    #[serde(default)]
    pub is_outgoing: bool,
    pub recipient: Option<PublicKey>,
    pub sign_with: Option<SignerSpec>,

    /// Request identifier for sync replies.
    pub in_response_to: Option<String>,
}

impl Envelope {
    fn empty(origin: EnvelopeOrigin) -> Self {
        Self {
            origin,
            state: EnvelopeState::Received,
            transit_ciphertext: None,
            transit_key_id: None,
            origin_ip: None,
            origin_port: None,
            event_ciphertext: None,
            seal_to: None,
            group_key_id: None,
            event_type: None,
            event_plaintext: None,
            event_id: None,
            signer: None,
            signature: None,
            deps: Vec::new(),
            placeholders: Vec::new(),
            is_outgoing: false,
            recipient: None,
            sign_with: None,
            in_response_to: None,
        }
    }

    /// A locally issued event awaiting the sign stage.
    pub fn local(
        event_type: impl Into<String>,
        payload: JsonValue,
        sign_with: SignerSpec,
    ) -> Self {
        let mut env = Self::empty(EnvelopeOrigin::LocalCommand);
        env.event_type = Some(event_type.into());
        env.placeholders = collect_placeholders(&payload);
        env.event_plaintext = Some(payload);
        env.sign_with = Some(sign_with);
        env
    }

    /// A raw inbound datagram.
    pub fn incoming(datagram: Vec<u8>, ip: Option<String>, port: Option<u16>) -> Self {
        let mut env = Self::empty(EnvelopeOrigin::IncomingDatagram);
        env.transit_ciphertext = Some(datagram);
        env.origin_ip = ip;
        env.origin_port = port;
        env
    }

    /// A fully-formed event materialized mid-run (sync payload unpacking).
    pub fn reflected_event(event: &Event) -> ProtocolResult<Self> {
        let mut env = Self::empty(EnvelopeOrigin::Reflected);
        env.state = EnvelopeState::Opened;
        env.event_type = Some(event.event_type.clone());
        env.event_plaintext = Some(event.payload.clone());
        env.signer = Some(event.signer);
        env.signature = Some(event.signature);
        env.event_id = Some(event.event_id()?);
        Ok(env)
    }

    /// Route to a peer, optionally encrypting under a group key.
    pub fn outgoing_to(mut self, recipient: PublicKey) -> Self {
        self.is_outgoing = true;
        self.recipient = Some(recipient);
        self
    }

    /// Route to every transit-reachable peer of the event's network.
    pub fn broadcast(mut self) -> Self {
        self.is_outgoing = true;
        self.recipient = None;
        self
    }

    /// Override the origin (job emissions, reflected responses).
    pub fn with_origin(mut self, origin: EnvelopeOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_group_key(mut self, key_id: KeyId) -> Self {
        self.group_key_id = Some(key_id);
        self
    }

    pub fn sealed_to(mut self, seal: SealPublicKey) -> Self {
        self.seal_to = Some(seal);
        self
    }

    pub fn responding_to(mut self, request_id: impl Into<String>) -> Self {
        self.in_response_to = Some(request_id.into());
        self
    }

    /// Assemble the signed event once type, payload, signer and signature
    /// are all present.
    pub fn event(&self) -> ProtocolResult<Event> {
        let event_type = self
            .event_type
            .clone()
            .ok_or_else(|| ProtocolError::malformed("envelope has no event_type"))?;
        let payload = self
            .event_plaintext
            .clone()
            .ok_or_else(|| ProtocolError::malformed("envelope has no plaintext"))?;
        let signer = self
            .signer
            .ok_or_else(|| ProtocolError::malformed("envelope has no signer"))?;
        let signature = self
            .signature
            .ok_or_else(|| ProtocolError::malformed("envelope has no signature"))?;
        Ok(Event {
            event_type,
            payload,
            signer,
            signature,
        })
    }

    /// True when every placeholder in the payload has been substituted.
    pub fn placeholders_resolved(&self) -> bool {
        self.event_plaintext
            .as_ref()
            .map(|p| collect_placeholders(p).is_empty())
            .unwrap_or(true)
    }
}

/// Build a `@generated:<type>:<index>` reference for multi-event commands.
pub fn placeholder(event_type: &str, index: usize) -> String {
    format!("@generated:{event_type}:{index}")
}

fn collect_placeholders(value: &JsonValue) -> Vec<String> {
    let mut found = Vec::new();
    walk_strings(value, &mut |s| {
        if s.starts_with("@generated:") {
            found.push(s.to_string());
        }
    });
    found
}

fn walk_strings(value: &JsonValue, f: &mut impl FnMut(&str)) {
    match value {
        JsonValue::String(s) => f(s),
        JsonValue::Array(items) => items.iter().for_each(|v| walk_strings(v, f)),
        JsonValue::Object(map) => map.values().for_each(|v| walk_strings(v, f)),
        _ => {}
    }
}

/// Substitute resolved event ids into a payload. Returns true when no
/// placeholder remains.
pub fn resolve_placeholders(
    value: &mut JsonValue,
    resolved: &HashMap<String, EventId>,
) -> bool {
    let mut complete = true;
    match value {
        JsonValue::String(s) => {
            if s.starts_with("@generated:") {
                if let Some(id) = resolved.get(s.as_str()) {
                    *s = id.to_hex();
                } else {
                    complete = false;
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                complete &= resolve_placeholders(item, resolved);
            }
        }
        JsonValue::Object(map) => {
            for item in map.values_mut() {
                complete &= resolve_placeholders(item, resolved);
            }
        }
        _ => {}
    }
    complete
}

/// Base64 serde for byte fields, keeping blocked-table JSON compact.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}

pub(crate) mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(s).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_collected_and_resolved() {
        let mut payload = serde_json::json!({
            "group_id": placeholder("group", 0),
            "name": "general",
            "nested": { "also": placeholder("key", 1) },
        });

        let env = Envelope::local(
            "channel",
            payload.clone(),
            SignerSpec::Identity(quiet_crypto::Keypair::generate().public()),
        );
        assert_eq!(env.placeholders.len(), 2);
        assert!(!env.placeholders_resolved());

        let mut resolved = HashMap::new();
        resolved.insert(placeholder("group", 0), EventId::from_bytes([1u8; 32]));
        assert!(!resolve_placeholders(&mut payload, &resolved));

        resolved.insert(placeholder("key", 1), EventId::from_bytes([2u8; 32]));
        assert!(resolve_placeholders(&mut payload, &resolved));
        assert_eq!(
            payload["group_id"].as_str().unwrap(),
            EventId::from_bytes([1u8; 32]).to_hex()
        );
    }

    #[test]
    fn envelope_survives_json_round_trip() {
        let mut env = Envelope::incoming(vec![1, 2, 3], Some("10.0.0.1".into()), Some(7000));
        env.deps.push(EventId::from_bytes([9u8; 32]));
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transit_ciphertext.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(back.deps, env.deps);
        assert_eq!(back.origin, EnvelopeOrigin::IncomingDatagram);
    }

    #[test]
    fn partition_keys_are_stable() {
        let reason = BlockReason::missing_dep(EventId::from_bytes([0xaa; 32]));
        assert!(reason.partition_key().starts_with("missing_dep:aaaa"));
    }
}
