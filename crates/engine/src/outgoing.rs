//! Outgoing queue: transit wrapping for the transport, per-destination retry.
//!
//! The pipeline enqueues wire blobs; the external transport calls
//! [`drain`] to pick up due datagrams, then reports `mark_sent` /
//! `mark_failed`. Rows with no usable transit key re-arm with backoff until
//! a `transit_secret` exchange (or invite bootstrap) provides one.

use quiet_core::{Clock, KeyId};
use quiet_crypto::{PublicKey, SymmetricKey};
use quiet_store::{map_sqlx_error, Store};
use sqlx::Row;
use tracing::debug;

use crate::cache::TransitCache;
use crate::error::{EngineError, EngineResult};

const RETRY_BASE_MS: i64 = 1_000;
const RETRY_CAP_MS: i64 = 60_000;

/// A wire-ready datagram for the transport.
#[derive(Debug, Clone)]
pub struct OutgoingDatagram {
    pub id: i64,
    pub recipient: PublicKey,
    /// `transit_key_id(32) ‖ transit_ct`.
    pub datagram: Vec<u8>,
}

fn backoff_ms(retry_count: i64) -> i64 {
    (RETRY_BASE_MS << retry_count.clamp(0, 16)).min(RETRY_CAP_MS)
}

/// Pick up to `limit` due unsent rows, transit-wrapping each. Rows without
/// a resolvable transit key are re-armed instead of returned.
pub async fn drain(
    store: &Store,
    cache: &TransitCache,
    clock: &dyn Clock,
    limit: i64,
) -> EngineResult<Vec<OutgoingDatagram>> {
    let now = clock.now_ms();
    cache.sweep(now);
    let mut txn = store.begin_immediate().await?;

    let rows = sqlx::query(
        "SELECT id, recipient, blob, transit_key_id, retry_count FROM outgoing \
         WHERE sent = 0 AND next_retry <= ?1 ORDER BY id ASC LIMIT ?2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("list outgoing", e)))?;

    let mut datagrams = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let recipient = PublicKey::from_slice(&row.get::<Vec<u8>, _>("recipient"))
            .map_err(EngineError::Crypto)?;
        let blob: Vec<u8> = row.get("blob");
        let pinned: Option<Vec<u8>> = row.get("transit_key_id");
        let retry_count: i64 = row.get("retry_count");

        let key = resolve_transit_key(&mut txn, cache, now, pinned, &recipient).await?;
        let Some(key) = key else {
            // No route yet; try again after backoff.
            sqlx::query(
                "UPDATE outgoing SET retry_count = retry_count + 1, next_retry = ?1 WHERE id = ?2",
            )
            .bind(now + backoff_ms(retry_count))
            .bind(id)
            .execute(txn.conn())
            .await
            .map_err(|e| EngineError::from(map_sqlx_error("re-arm outgoing", e)))?;
            debug!(id, recipient = %recipient, "no transit key for outgoing row");
            continue;
        };

        let ct = quiet_crypto::encrypt(&key, &blob).map_err(EngineError::Crypto)?;
        let key_id = key.id();
        let mut datagram = Vec::with_capacity(key_id.as_bytes().len() + ct.len());
        datagram.extend_from_slice(key_id.as_bytes());
        datagram.extend_from_slice(&ct);

        datagrams.push(OutgoingDatagram {
            id,
            recipient,
            datagram,
        });
    }

    txn.commit().await?;
    Ok(datagrams)
}

async fn resolve_transit_key(
    txn: &mut quiet_store::WriteTxn,
    cache: &TransitCache,
    now_ms: i64,
    pinned: Option<Vec<u8>>,
    recipient: &PublicKey,
) -> EngineResult<Option<SymmetricKey>> {
    if let Some(pinned) = pinned {
        let key_id =
            KeyId::from_slice(&pinned).map_err(|e| EngineError::Transport(e.to_string()))?;
        if let Some(key) = cache.get_by_key_id(key_id, now_ms) {
            return Ok(Some(key));
        }
        let row = sqlx::query(
            "SELECT secret FROM transit_keys WHERE key_id = ?1 AND secret IS NOT NULL",
        )
        .bind(&pinned[..])
        .fetch_optional(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("pinned transit key", e)))?;
        if let Some(row) = row {
            return Ok(Some(
                SymmetricKey::from_slice(&row.get::<Vec<u8>, _>("secret"))
                    .map_err(EngineError::Crypto)?,
            ));
        }
    }

    let row = sqlx::query(
        "SELECT secret FROM transit_keys \
         WHERE peer_pubkey = ?1 AND secret IS NOT NULL \
         ORDER BY created_at_ms DESC LIMIT 1",
    )
    .bind(&recipient.as_bytes()[..])
    .fetch_optional(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("recipient transit key", e)))?;

    row.map(|r| {
        SymmetricKey::from_slice(&r.get::<Vec<u8>, _>("secret")).map_err(EngineError::Crypto)
    })
    .transpose()
}

/// The transport delivered this row.
pub async fn mark_sent(store: &Store, id: i64) -> EngineResult<()> {
    let mut txn = store.begin_immediate().await?;
    sqlx::query("UPDATE outgoing SET sent = 1 WHERE id = ?1")
        .bind(id)
        .execute(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("mark sent", e)))?;
    txn.commit().await?;
    Ok(())
}

/// Delivery failed; exponential per-destination backoff.
pub async fn mark_failed(store: &Store, clock: &dyn Clock, id: i64) -> EngineResult<()> {
    let now = clock.now_ms();
    let mut txn = store.begin_immediate().await?;

    let retry_count: i64 = sqlx::query("SELECT retry_count FROM outgoing WHERE id = ?1")
        .bind(id)
        .fetch_optional(txn.conn())
        .await
        .map_err(|e| EngineError::from(map_sqlx_error("read outgoing", e)))?
        .map(|row| row.get("retry_count"))
        .unwrap_or(0);

    sqlx::query(
        "UPDATE outgoing SET retry_count = retry_count + 1, next_retry = ?1 WHERE id = ?2",
    )
    .bind(now + backoff_ms(retry_count + 1))
    .bind(id)
    .execute(txn.conn())
    .await
    .map_err(|e| EngineError::from(map_sqlx_error("mark failed", e)))?;
    txn.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ms(0), 1_000);
        assert_eq!(backoff_ms(1), 2_000);
        assert_eq!(backoff_ms(5), 32_000);
        assert_eq!(backoff_ms(10), RETRY_CAP_MS);
        assert_eq!(backoff_ms(40), RETRY_CAP_MS);
    }
}
