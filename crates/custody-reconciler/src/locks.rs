//! Exclusive broadcast locks.
//!
//! At most one broadcast is in flight per order id, or per source address for
//! address-batched kinds. The guard is held from `pending -> broadcasting`
//! until the adapter result has been folded.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;

use custody_core::OrderId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Order(OrderId),
    Address { coin_name: String, address: String },
}

impl LockKey {
    pub fn address(coin_name: &str, address: &str) -> Self {
        Self::Address {
            coin_name: coin_name.to_string(),
            address: address.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BroadcastLocks {
    held: DashMap<LockKey, Instant>,
}

impl BroadcastLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, or `None` if another broadcast holds it.
    pub fn try_acquire(&self, key: LockKey) -> Option<BroadcastGuard<'_>> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(BroadcastGuard { locks: self, key })
            }
        }
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct BroadcastGuard<'a> {
    locks: &'a BroadcastLocks,
    key: LockKey,
}

impl BroadcastGuard<'_> {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for BroadcastGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let locks = BroadcastLocks::new();
        let guard = locks.try_acquire(LockKey::Order(OrderId(1))).unwrap();
        assert!(locks.try_acquire(LockKey::Order(OrderId(1))).is_none());
        assert!(locks.try_acquire(LockKey::Order(OrderId(2))).is_some());
        assert_eq!(locks.held_count(), 1);

        drop(guard);
        assert!(!locks.is_held(&LockKey::Order(OrderId(1))));
        assert!(locks.try_acquire(LockKey::Order(OrderId(1))).is_some());
    }

    #[test]
    fn test_address_keys_are_per_coin() {
        let locks = BroadcastLocks::new();
        let _a = locks.try_acquire(LockKey::address("eth", "dep1")).unwrap();
        assert!(locks.try_acquire(LockKey::address("eth", "dep1")).is_none());
        assert!(locks.try_acquire(LockKey::address("usdt", "dep1")).is_some());
    }
}
