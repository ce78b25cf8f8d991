//! System address cache.
//!
//! Entries never expire; only an explicit rotation invalidates them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use custody_core::SystemAddressKind;

/// Cached system address with rotation tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCacheEntry {
    pub address: String,
    pub cached_at: DateTime<Utc>,
    /// Incremented each time the slot is rotated.
    pub version: u64,
}

/// Cache of hot/cold addresses per coin.
#[derive(Debug, Default)]
pub struct SystemAddressCache {
    entries: DashMap<(String, SystemAddressKind), SystemCacheEntry>,
    /// Rotation counters survive invalidation.
    versions: DashMap<(String, SystemAddressKind), u64>,
}

impl SystemAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, coin_name: &str, kind: SystemAddressKind) -> Option<String> {
        self.entries
            .get(&(coin_name.to_string(), kind))
            .map(|e| e.address.clone())
    }

    pub fn entry(&self, coin_name: &str, kind: SystemAddressKind) -> Option<SystemCacheEntry> {
        self.entries
            .get(&(coin_name.to_string(), kind))
            .map(|e| e.value().clone())
    }

    /// Store a resolved address. An existing entry wins, so concurrent
    /// resolvers agree on one value.
    pub fn put(&self, coin_name: &str, kind: SystemAddressKind, address: String) -> String {
        let slot = (coin_name.to_string(), kind);
        let version = self.versions.get(&slot).map(|v| *v).unwrap_or(0);
        self.entries
            .entry(slot)
            .or_insert_with(|| SystemCacheEntry {
                address,
                cached_at: Utc::now(),
                version,
            })
            .address
            .clone()
    }

    /// Invalidate one slot; the next lookup resolves it again.
    pub fn rotate(&self, coin_name: &str, kind: SystemAddressKind) -> Option<String> {
        let slot = (coin_name.to_string(), kind);
        *self.versions.entry(slot.clone()).or_insert(0) += 1;
        let removed = self.entries.remove(&slot).map(|(_, e)| e.address);
        info!(coin = coin_name, ?kind, previous = ?removed, "System address rotated");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_put_wins() {
        let cache = SystemAddressCache::new();
        assert_eq!(cache.put("eth", SystemAddressKind::Hot, "hot1".into()), "hot1");
        assert_eq!(cache.put("eth", SystemAddressKind::Hot, "hot2".into()), "hot1");
        assert_eq!(cache.get("eth", SystemAddressKind::Hot).as_deref(), Some("hot1"));
        assert!(cache.get("eth", SystemAddressKind::Cold).is_none());
    }

    #[test]
    fn test_rotation_invalidates_and_bumps_version() {
        let cache = SystemAddressCache::new();
        cache.put("eth", SystemAddressKind::Cold, "cold1".into());
        assert_eq!(cache.entry("eth", SystemAddressKind::Cold).unwrap().version, 0);

        assert_eq!(
            cache.rotate("eth", SystemAddressKind::Cold).as_deref(),
            Some("cold1")
        );
        assert!(cache.get("eth", SystemAddressKind::Cold).is_none());

        cache.put("eth", SystemAddressKind::Cold, "cold2".into());
        let entry = cache.entry("eth", SystemAddressKind::Cold).unwrap();
        assert_eq!(entry.address, "cold2");
        assert_eq!(entry.version, 1);
    }
}
