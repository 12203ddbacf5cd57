//! Query contexts handed to registry operations.
//!
//! One context type backs both roles: validators and reflectors receive it as
//! a read-only view (`ReadCtx`, read-only by convention, enforced by the
//! helpers they use), command builders receive the same connection with write
//! intent (`CommandCtx`). Both always run inside the pipeline's write
//! transaction, so reads observe everything the current run has done so far.

use sqlx::{Row, SqliteConnection};

use quiet_core::{EventId, KeyId};
use quiet_crypto::{Keypair, PublicKey, SealPublicKey, SymmetricKey};

use crate::event::Event;
use crate::{db_err, ProtocolError, ProtocolResult};

/// Context for validators and reflectors (read-only by convention).
pub type ReadCtx<'a> = Ctx<'a>;
/// Context for command builders (same transaction, write intent).
pub type CommandCtx<'a> = Ctx<'a>;

pub struct Ctx<'a> {
    conn: &'a mut SqliteConnection,
    now_ms: i64,
}

impl<'a> Ctx<'a> {
    pub fn new(conn: &'a mut SqliteConnection, now_ms: i64) -> Self {
        Self { conn, now_ms }
    }

    /// The transaction's wall-clock timestamp.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Raw connection for kind-specific SQL.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }

    pub async fn event_exists(&mut self, id: EventId) -> ProtocolResult<bool> {
        let row = sqlx::query("SELECT 1 FROM events WHERE event_id = ?1")
            .bind(&id.as_bytes()[..])
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err("event exists"))?;
        Ok(row.is_some())
    }

    pub async fn fetch_event(&mut self, id: EventId) -> ProtocolResult<Option<Event>> {
        let row = sqlx::query("SELECT payload_blob FROM events WHERE event_id = ?1")
            .bind(&id.as_bytes()[..])
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err("fetch event"))?;
        row.map(|r| Event::from_canonical_bytes(&r.get::<Vec<u8>, _>("payload_blob")))
            .transpose()
    }

    /// Events of a network at or after `since_ms`, commit-ordered, bounded.
    pub async fn events_since(
        &mut self,
        network_id: EventId,
        since_ms: i64,
        limit: i64,
    ) -> ProtocolResult<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT payload_blob FROM events \
             WHERE network_id = ?1 AND created_at_ms >= ?2 \
             ORDER BY created_at_ms ASC, event_id ASC LIMIT ?3",
        )
        .bind(&network_id.as_bytes()[..])
        .bind(since_ms)
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(db_err("events since"))?;

        rows.iter()
            .map(|r| Event::from_canonical_bytes(&r.get::<Vec<u8>, _>("payload_blob")))
            .collect()
    }

    /// Newest stored timestamp for a network, or 0 for an empty log.
    pub async fn latest_event_ms(&mut self, network_id: EventId) -> ProtocolResult<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(created_at_ms), 0) AS latest FROM events WHERE network_id = ?1",
        )
        .bind(&network_id.as_bytes()[..])
        .fetch_one(&mut *self.conn)
        .await
        .map_err(db_err("latest event"))?;
        Ok(row.get::<i64, _>("latest"))
    }

    /// A group key's secret, if this node has learned it.
    pub async fn group_key(&mut self, key_id: KeyId) -> ProtocolResult<Option<SymmetricKey>> {
        let row = sqlx::query(
            "SELECT secret FROM group_keys WHERE key_id = ?1 AND secret IS NOT NULL",
        )
        .bind(&key_id.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("group key"))?;
        row.map(|r| SymmetricKey::from_slice(&r.get::<Vec<u8>, _>("secret")).map_err(Into::into))
            .transpose()
    }

    /// The newest usable group key for a group.
    pub async fn group_key_for_group(
        &mut self,
        group_id: EventId,
    ) -> ProtocolResult<Option<(KeyId, SymmetricKey)>> {
        let row = sqlx::query(
            "SELECT key_id, secret FROM group_keys \
             WHERE group_id = ?1 AND secret IS NOT NULL \
             ORDER BY created_at_ms DESC LIMIT 1",
        )
        .bind(&group_id.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("group key for group"))?;

        row.map(|r| {
            let key_id = KeyId::from_slice(&r.get::<Vec<u8>, _>("key_id"))
                .map_err(|e| ProtocolError::malformed(e.to_string()))?;
            let secret = SymmetricKey::from_slice(&r.get::<Vec<u8>, _>("secret"))?;
            Ok::<_, ProtocolError>((key_id, secret))
        })
        .transpose()
    }

    /// A transit key by id (durable store; the engine layers its 30 s
    /// ephemeral cache on top).
    pub async fn transit_key(&mut self, key_id: KeyId) -> ProtocolResult<Option<SymmetricKey>> {
        let row = sqlx::query(
            "SELECT secret FROM transit_keys WHERE key_id = ?1 AND secret IS NOT NULL",
        )
        .bind(&key_id.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("transit key"))?;
        row.map(|r| SymmetricKey::from_slice(&r.get::<Vec<u8>, _>("secret")).map_err(Into::into))
            .transpose()
    }

    /// Load a local identity's keypair. Secrets stay lazy: loaded per
    /// transaction, never cached across them.
    pub async fn identity_keypair(
        &mut self,
        pubkey: &PublicKey,
    ) -> ProtocolResult<Option<Keypair>> {
        let row = sqlx::query(
            "SELECT secret FROM identities WHERE pubkey = ?1 AND secret IS NOT NULL",
        )
        .bind(&pubkey.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("identity keypair"))?;
        row.map(|r| Keypair::from_secret_bytes(&r.get::<Vec<u8>, _>("secret")).map_err(Into::into))
            .transpose()
    }

    /// Find the local identity whose derived sealing key matches `seal_to`.
    pub async fn identity_for_seal(
        &mut self,
        seal: &SealPublicKey,
    ) -> ProtocolResult<Option<Keypair>> {
        let row = sqlx::query(
            "SELECT secret FROM identities WHERE seal_pubkey = ?1 AND secret IS NOT NULL",
        )
        .bind(&seal.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("identity for seal"))?;
        row.map(|r| Keypair::from_secret_bytes(&r.get::<Vec<u8>, _>("secret")).map_err(Into::into))
            .transpose()
    }

    /// The local signing identity for a network, if one exists.
    pub async fn identity_for_network(
        &mut self,
        network_id: EventId,
    ) -> ProtocolResult<Option<PublicKey>> {
        let row = sqlx::query(
            "SELECT pubkey FROM identities WHERE network_id = ?1 \
             ORDER BY created_at_ms ASC LIMIT 1",
        )
        .bind(&network_id.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("identity for network"))?;
        row.map(|r| {
            PublicKey::from_slice(&r.get::<Vec<u8>, _>("pubkey")).map_err(Into::into)
        })
        .transpose()
    }

    /// Every network this node holds an identity for.
    pub async fn local_networks(&mut self) -> ProtocolResult<Vec<(EventId, PublicKey)>> {
        let rows = sqlx::query(
            "SELECT network_id, pubkey FROM identities WHERE network_id IS NOT NULL",
        )
        .fetch_all(&mut *self.conn)
        .await
        .map_err(db_err("local networks"))?;

        rows.iter()
            .map(|r| {
                let network = EventId::from_slice(&r.get::<Vec<u8>, _>("network_id"))
                    .map_err(|e| ProtocolError::malformed(e.to_string()))?;
                let pubkey = PublicKey::from_slice(&r.get::<Vec<u8>, _>("pubkey"))?;
                Ok((network, pubkey))
            })
            .collect()
    }

    /// Whether `signer` has a user row in the network.
    pub async fn signer_is_member(
        &mut self,
        network_id: EventId,
        signer: &PublicKey,
    ) -> ProtocolResult<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE network_id = ?1 AND pubkey = ?2")
            .bind(&network_id.as_bytes()[..])
            .bind(&signer.as_bytes()[..])
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err("signer is member"))?;
        Ok(row.is_some())
    }

    /// The user row id for a signer within a network.
    pub async fn user_id_for_pubkey(
        &mut self,
        network_id: EventId,
        pubkey: &PublicKey,
    ) -> ProtocolResult<Option<EventId>> {
        let row = sqlx::query("SELECT user_id FROM users WHERE network_id = ?1 AND pubkey = ?2")
            .bind(&network_id.as_bytes()[..])
            .bind(&pubkey.as_bytes()[..])
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err("user id for pubkey"))?;
        row.map(|r| {
            EventId::from_slice(&r.get::<Vec<u8>, _>("user_id"))
                .map_err(|e| ProtocolError::malformed(e.to_string()))
        })
        .transpose()
    }

    /// Tombstone check. A removed signer is terminally invalid.
    pub async fn is_removed(
        &mut self,
        network_id: EventId,
        pubkey: &PublicKey,
    ) -> ProtocolResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM removed_peers WHERE network_id = ?1 AND pubkey = ?2",
        )
        .bind(&network_id.as_bytes()[..])
        .bind(&pubkey.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("is removed"))?;
        Ok(row.is_some())
    }

    /// Whether an invite with this proof key exists in the network.
    pub async fn invite_exists(
        &mut self,
        network_id: EventId,
        invite_pubkey: &PublicKey,
    ) -> ProtocolResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM invites WHERE network_id = ?1 AND invite_pubkey = ?2",
        )
        .bind(&network_id.as_bytes()[..])
        .bind(&invite_pubkey.as_bytes()[..])
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err("invite exists"))?;
        Ok(row.is_some())
    }

    pub async fn network_creator(
        &mut self,
        network_id: EventId,
    ) -> ProtocolResult<Option<PublicKey>> {
        let row = sqlx::query("SELECT creator_pubkey FROM networks WHERE network_id = ?1")
            .bind(&network_id.as_bytes()[..])
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err("network creator"))?;
        row.map(|r| {
            PublicKey::from_slice(&r.get::<Vec<u8>, _>("creator_pubkey")).map_err(Into::into)
        })
        .transpose()
    }

    /// Peers reachable through a durable transit key, for outbound fan-out.
    pub async fn transit_reachable_peers(
        &mut self,
        network_id: EventId,
    ) -> ProtocolResult<Vec<PublicKey>> {
        let rows = sqlx::query(
            "SELECT DISTINCT peer_pubkey FROM transit_keys \
             WHERE network_id = ?1 AND peer_pubkey IS NOT NULL AND secret IS NOT NULL",
        )
        .bind(&network_id.as_bytes()[..])
        .fetch_all(&mut *self.conn)
        .await
        .map_err(db_err("transit reachable peers"))?;

        rows.iter()
            .map(|r| PublicKey::from_slice(&r.get::<Vec<u8>, _>("peer_pubkey")).map_err(Into::into))
            .collect()
    }
}
