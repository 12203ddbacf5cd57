//! Ephemeral transit-secret cache.
//!
//! The only in-memory state the engine keeps: request-scoped transit keys
//! with a 30 s TTL, keyed by sync request id. It bridges the window between
//! answering a request and the durable `transit_keys` row existing on both
//! sides. Swept at every transaction begin; never authoritative.

use std::collections::HashMap;
use std::sync::Mutex;

use quiet_core::KeyId;
use quiet_crypto::SymmetricKey;

/// Entry lifetime.
pub const TRANSIT_CACHE_TTL_MS: i64 = 30_000;

#[derive(Debug, Default)]
pub struct TransitCache {
    entries: Mutex<HashMap<String, (SymmetricKey, i64)>>,
}

impl TransitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request_id: &str, key: SymmetricKey, now_ms: i64) {
        let mut entries = self.entries.lock().expect("transit cache lock");
        entries.insert(
            request_id.to_string(),
            (key, now_ms + TRANSIT_CACHE_TTL_MS),
        );
    }

    pub fn get(&self, request_id: &str, now_ms: i64) -> Option<SymmetricKey> {
        let entries = self.entries.lock().expect("transit cache lock");
        entries
            .get(request_id)
            .filter(|(_, expires)| *expires > now_ms)
            .map(|(key, _)| key.clone())
    }

    /// Lookup by key id, for inbound transit decryption.
    pub fn get_by_key_id(&self, key_id: KeyId, now_ms: i64) -> Option<SymmetricKey> {
        let entries = self.entries.lock().expect("transit cache lock");
        entries
            .values()
            .filter(|(_, expires)| *expires > now_ms)
            .map(|(key, _)| key)
            .find(|key| key.id() == key_id)
            .cloned()
    }

    /// Drop expired entries. Called at transaction begin.
    pub fn sweep(&self, now_ms: i64) {
        let mut entries = self.entries.lock().expect("transit cache lock");
        entries.retain(|_, (_, expires)| *expires > now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire() {
        let cache = TransitCache::new();
        let key = SymmetricKey::generate();
        cache.insert("req-1", key.clone(), 1_000);

        assert!(cache.get("req-1", 1_000).is_some());
        assert!(cache.get_by_key_id(key.id(), 1_000).is_some());
        assert!(cache.get("req-1", 1_000 + TRANSIT_CACHE_TTL_MS + 1).is_none());
    }

    #[test]
    fn sweep_drops_expired() {
        let cache = TransitCache::new();
        cache.insert("req-1", SymmetricKey::generate(), 0);
        cache.insert("req-2", SymmetricKey::generate(), 50_000);
        cache.sweep(40_000);

        assert!(cache.get("req-1", 40_000).is_none());
        assert!(cache.get("req-2", 40_000).is_some());
    }
}
