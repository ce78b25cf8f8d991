//! Address ownership registry.
//!
//! Maps `(coin_name, address)` to the issued address and its owner. Issuance
//! and state changes go through the per-key entry lock of the underlying map,
//! so readers never observe a half-written entry.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use custody_core::{Address, AddressOwner, AddressRole, AddressState, IssuedAddress};

use crate::error::{RegistryError, RegistryResult};

type RegistryKey = (String, String);

fn key(coin_name: &str, address: &str) -> RegistryKey {
    (coin_name.to_string(), address.to_string())
}

/// System-owned addresses of one chain.
#[derive(Debug, Default)]
pub struct AddressRegistry {
    entries: DashMap<RegistryKey, IssuedAddress>,
    /// Next deposit derivation index.
    next_index: AtomicU32,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next derivation index.
    pub fn allocate_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an address.
    ///
    /// Re-registering the same address with the same role is a no-op that
    /// returns the existing entry; a different role is a conflict.
    pub fn register(
        &self,
        coin_name: &str,
        address: Address,
        owner: Option<AddressOwner>,
        index: Option<u32>,
    ) -> RegistryResult<IssuedAddress> {
        match self.entries.entry(key(coin_name, &address.address)) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.address.role != address.role {
                    return Err(RegistryError::AddressConflict {
                        coin_name: coin_name.to_string(),
                        address: address.address,
                        existing: existing.address.role,
                    });
                }
                Ok(existing.clone())
            }
            Entry::Vacant(slot) => {
                debug!(
                    coin = coin_name,
                    address = %address.address,
                    role = %address.role,
                    "Registering address"
                );
                let issued = IssuedAddress {
                    address,
                    coin_name: coin_name.to_string(),
                    owner,
                    index,
                    created_at: Utc::now(),
                };
                slot.insert(issued.clone());
                if let Some(i) = index {
                    self.next_index.fetch_max(i.saturating_add(1), Ordering::SeqCst);
                }
                Ok(issued)
            }
        }
    }

    pub fn get(&self, coin_name: &str, address: &str) -> Option<IssuedAddress> {
        self.entries
            .get(&key(coin_name, address))
            .map(|e| e.value().clone())
    }

    pub fn role_of(&self, coin_name: &str, address: &str) -> Option<AddressRole> {
        self.entries
            .get(&key(coin_name, address))
            .map(|e| e.address.role)
    }

    pub fn is_hot_address(&self, coin_name: &str, address: &str) -> bool {
        self.role_of(coin_name, address) == Some(AddressRole::Hot)
    }

    pub fn is_cold_address(&self, coin_name: &str, address: &str) -> bool {
        self.role_of(coin_name, address) == Some(AddressRole::Cold)
    }

    pub fn is_deposit_address(&self, coin_name: &str, address: &str) -> bool {
        self.role_of(coin_name, address) == Some(AddressRole::Deposit)
    }

    /// Hot or cold: transfers between these are internal.
    pub fn is_wallet_address(&self, coin_name: &str, address: &str) -> bool {
        matches!(
            self.role_of(coin_name, address),
            Some(AddressRole::Hot | AddressRole::Cold)
        )
    }

    pub fn contains(&self, coin_name: &str, address: &str) -> bool {
        self.entries.contains_key(&key(coin_name, address))
    }

    /// Change the state of an address. Retired is final.
    pub fn set_state(
        &self,
        coin_name: &str,
        address: &str,
        state: AddressState,
    ) -> RegistryResult<()> {
        let mut entry = self
            .entries
            .get_mut(&key(coin_name, address))
            .ok_or_else(|| RegistryError::UnknownAddress {
                coin_name: coin_name.to_string(),
                address: address.to_string(),
            })?;
        entry.address.set_state(state)?;
        info!(coin = coin_name, address, state = %state, "Address state changed");
        Ok(())
    }

    /// Every address with `role` for `coin_name`.
    pub fn addresses_with_role(&self, coin_name: &str, role: AddressRole) -> Vec<IssuedAddress> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.coin_name == coin_name && e.address.role == role)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.address.address.cmp(&b.address.address));
        out
    }

    /// Every registered address, for snapshots.
    pub fn all(&self) -> Vec<IssuedAddress> {
        let mut out: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| {
            (&a.coin_name, &a.address.address).cmp(&(&b.coin_name, &b.address.address))
        });
        out
    }

    /// Reload addresses from a snapshot.
    pub fn restore(&self, addresses: Vec<IssuedAddress>) {
        for issued in addresses {
            if let Some(i) = issued.index {
                self.next_index.fetch_max(i.saturating_add(1), Ordering::SeqCst);
            }
            self.entries
                .insert(key(&issued.coin_name, &issued.address.address), issued);
        }
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
    use custody_core::BizMode;
    use std::sync::Arc;

    fn owner() -> AddressOwner {
        AddressOwner {
            appid: "app".to_string(),
            callback: "https://cb".to_string(),
            biz_mode: BizMode::Deposit,
        }
    }

    #[test]
    fn test_role_membership() {
        let reg = AddressRegistry::new();
        reg.register("eth", Address::new(AddressRole::Hot, "0", "hot1"), None, None)
            .unwrap();
        reg.register("eth", Address::new(AddressRole::Cold, "0", "cold1"), None, None)
            .unwrap();
        reg.register(
            "eth",
            Address::new(AddressRole::Deposit, "0", "dep1"),
            Some(owner()),
            Some(0),
        )
        .unwrap();

        assert!(reg.is_hot_address("eth", "hot1"));
        assert!(!reg.is_hot_address("usdt", "hot1"));
        assert!(reg.is_cold_address("eth", "cold1"));
        assert!(reg.is_deposit_address("eth", "dep1"));
        assert!(reg.is_wallet_address("eth", "cold1"));
        assert!(!reg.is_wallet_address("eth", "dep1"));
        assert!(!reg.contains("eth", "userA"));
    }

    #[test]
    fn test_register_is_idempotent_and_detects_conflict() {
        let reg = AddressRegistry::new();
        let first = reg
            .register("eth", Address::new(AddressRole::Deposit, "0", "dep1"), None, Some(4))
            .unwrap();
        let again = reg
            .register("eth", Address::new(AddressRole::Deposit, "0", "dep1"), None, Some(4))
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(reg.len(), 1);

        let err = reg
            .register("eth", Address::new(AddressRole::Hot, "0", "dep1"), None, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AddressConflict { .. }));
        // index past the registered one
        assert_eq!(reg.allocate_index(), 5);
    }

    #[test]
    fn test_set_state_respects_retired() {
        let reg = AddressRegistry::new();
        reg.register("eth", Address::new(AddressRole::Deposit, "0", "dep1"), None, None)
            .unwrap();
        reg.set_state("eth", "dep1", AddressState::Retired).unwrap();
        assert!(reg.set_state("eth", "dep1", AddressState::Active).is_err());
        assert!(reg.set_state("eth", "nope", AddressState::Frozen).is_err());
    }

    #[test]
    fn test_concurrent_index_allocation_is_unique() {
        let reg = Arc::new(AddressRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || (0..100).map(|_| reg.allocate_index()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_restore_advances_index() {
        let reg = AddressRegistry::new();
        reg.register("eth", Address::new(AddressRole::Deposit, "0", "dep9"), None, Some(9))
            .unwrap();
        let snapshot = reg.all();

        let restored = AddressRegistry::new();
        restored.restore(snapshot);
        assert!(restored.is_deposit_address("eth", "dep9"));
        assert_eq!(restored.allocate_index(), 10);
    }
}
