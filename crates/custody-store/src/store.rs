//! Ledger state store.
//!
//! Holds orders, record links, the scan cursor, recent block hashes and
//! manual-intervention records for one chain. [`MemoryStore`] keeps all of it
//! behind one lock and can snapshot to / restore from a JSON file.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use custody_core::{
    BlockNumber, IssuedAddress, ManualIntervention, OrderId, OrderStatus, RecordKey,
    TrackedOrder,
};

use crate::error::{StoreError, StoreResult};

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Mutation applied inside [`LedgerStore::update_order`].
pub type OrderMutation<'a> = &'a mut dyn FnMut(&mut TrackedOrder) -> custody_core::Result<()>;

/// Persistence seam for the reconciliation engine.
///
/// Every method is atomic with respect to every other.
pub trait LedgerStore: Send + Sync {
    /// Allocate a fresh order id.
    fn next_order_id(&self) -> OrderId;

    /// Insert a new order. An order carrying a record key that is already
    /// mapped fails with [`StoreError::DuplicateRecord`].
    fn insert_order(&self, order: TrackedOrder) -> StoreResult<()>;

    fn order(&self, id: OrderId) -> Option<TrackedOrder>;

    /// Apply `f` to a copy of the order and commit it only if `f` succeeds.
    fn update_order(&self, id: OrderId, f: OrderMutation<'_>) -> StoreResult<TrackedOrder>;

    /// Orders in any of `statuses`, ascending by id.
    fn orders_by_status(&self, statuses: &[OrderStatus]) -> Vec<TrackedOrder>;

    fn all_orders(&self) -> Vec<TrackedOrder>;

    /// Orders whose transaction is `txid`.
    fn orders_by_txid(&self, txid: &str) -> Vec<OrderId>;

    fn record_link(&self, key: &RecordKey) -> Option<OrderId>;

    /// Map a scanned record onto an existing order. Linking the same pair
    /// again is a no-op; a key mapped elsewhere fails with
    /// [`StoreError::DuplicateRecord`].
    fn link_record(&self, key: RecordKey, id: OrderId) -> StoreResult<()>;

    /// Last fully processed block.
    fn cursor(&self) -> Option<BlockNumber>;

    fn set_cursor(&self, bn: BlockNumber);

    fn block_hash(&self, bn: BlockNumber) -> Option<String>;

    fn put_block_hash(&self, bn: BlockNumber, hash: String);

    /// Forget hashes from `height` up (after a reorg).
    fn remove_block_hashes_from(&self, height: BlockNumber);

    /// Forget hashes below `height`.
    fn prune_block_hashes(&self, below: BlockNumber);

    fn push_intervention(&self, record: ManualIntervention);

    fn interventions(&self) -> Vec<ManualIntervention>;

    fn ruler_data(&self) -> Option<serde_json::Value>;

    fn set_ruler_data(&self, data: serde_json::Value);

    fn set_addresses(&self, addresses: Vec<IssuedAddress>);

    fn addresses(&self) -> Vec<IssuedAddress>;
}

/// Serializable store contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub next_order_id: u64,
    pub orders: Vec<TrackedOrder>,
    pub record_links: Vec<(RecordKey, OrderId)>,
    pub cursor: Option<BlockNumber>,
    pub block_hashes: BTreeMap<BlockNumber, String>,
    pub interventions: Vec<ManualIntervention>,
    pub addresses: Vec<IssuedAddress>,
    #[serde(default)]
    pub ruler_data: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_order_id: u64,
    orders: BTreeMap<OrderId, TrackedOrder>,
    txids: HashMap<String, Vec<OrderId>>,
    record_links: HashMap<RecordKey, OrderId>,
    cursor: Option<BlockNumber>,
    block_hashes: BTreeMap<BlockNumber, String>,
    interventions: Vec<ManualIntervention>,
    addresses: Vec<IssuedAddress>,
    ruler_data: Option<serde_json::Value>,
}

impl StoreState {
    fn index_txid(&mut self, order: &TrackedOrder) {
        if let Some(txid) = &order.txid {
            let ids = self.txids.entry(txid.clone()).or_default();
            if !ids.contains(&order.id()) {
                ids.push(order.id());
            }
        }
    }

    fn unindex_txid(&mut self, txid: &str, id: OrderId) {
        if let Some(ids) = self.txids.get_mut(txid) {
            ids.retain(|x| *x != id);
            if ids.is_empty() {
                self.txids.remove(txid);
            }
        }
    }
}

/// In-memory [`LedgerStore`] with JSON snapshots.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_order_id: 1,
                ..StoreState::default()
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let st = self.state.lock();
        let mut record_links: Vec<_> = st
            .record_links
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        record_links.sort();
        Snapshot {
            version: SNAPSHOT_VERSION,
            next_order_id: st.next_order_id,
            orders: st.orders.values().cloned().collect(),
            record_links,
            cursor: st.cursor,
            block_hashes: st.block_hashes.clone(),
            interventions: st.interventions.clone(),
            addresses: st.addresses.clone(),
            ruler_data: st.ruler_data.clone(),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> StoreResult<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::SnapshotVersion(snapshot.version));
        }
        let mut state = StoreState {
            next_order_id: snapshot.next_order_id.max(1),
            cursor: snapshot.cursor,
            block_hashes: snapshot.block_hashes,
            interventions: snapshot.interventions,
            addresses: snapshot.addresses,
            ruler_data: snapshot.ruler_data,
            record_links: snapshot.record_links.into_iter().collect(),
            ..StoreState::default()
        };
        for order in snapshot.orders {
            state.index_txid(&order);
            state.next_order_id = state.next_order_id.max(order.id().0 + 1);
            state.orders.insert(order.id(), order);
        }
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Write a snapshot atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let snapshot = self.snapshot();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        debug!(
            path = %path.display(),
            orders = snapshot.orders.len(),
            cursor = ?snapshot.cursor,
            "Snapshot saved"
        );
        Ok(())
    }

    /// Load a snapshot, or start empty when the file does not exist.
    pub fn load_or_new(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        info!(
            path = %path.display(),
            orders = snapshot.orders.len(),
            cursor = ?snapshot.cursor,
            "Snapshot restored"
        );
        Self::from_snapshot(snapshot)
    }
}

impl LedgerStore for MemoryStore {
    fn next_order_id(&self) -> OrderId {
        let mut st = self.state.lock();
        let id = OrderId(st.next_order_id.max(1));
        st.next_order_id = id.0 + 1;
        id
    }

    fn insert_order(&self, order: TrackedOrder) -> StoreResult<()> {
        let mut st = self.state.lock();
        let id = order.id();
        if st.orders.contains_key(&id) {
            return Err(StoreError::DuplicateOrder(id));
        }
        if let Some(key) = &order.record {
            if let Some(existing) = st.record_links.get(key) {
                return Err(StoreError::DuplicateRecord {
                    key: key.clone(),
                    existing: *existing,
                });
            }
            st.record_links.insert(key.clone(), id);
        }
        st.index_txid(&order);
        st.next_order_id = st.next_order_id.max(id.0 + 1);
        st.orders.insert(id, order);
        Ok(())
    }

    fn order(&self, id: OrderId) -> Option<TrackedOrder> {
        self.state.lock().orders.get(&id).cloned()
    }

    fn update_order(&self, id: OrderId, f: OrderMutation<'_>) -> StoreResult<TrackedOrder> {
        let mut st = self.state.lock();
        let mut updated = st
            .orders
            .get(&id)
            .cloned()
            .ok_or(StoreError::UnknownOrder(id))?;
        let previous_txid = updated.txid.clone();
        f(&mut updated)?;
        if previous_txid != updated.txid {
            if let Some(old) = &previous_txid {
                st.unindex_txid(old, id);
            }
            st.index_txid(&updated);
        }
        st.orders.insert(id, updated.clone());
        Ok(updated)
    }

    fn orders_by_status(&self, statuses: &[OrderStatus]) -> Vec<TrackedOrder> {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| statuses.contains(&o.status))
            .cloned()
            .collect()
    }

    fn all_orders(&self) -> Vec<TrackedOrder> {
        self.state.lock().orders.values().cloned().collect()
    }

    fn orders_by_txid(&self, txid: &str) -> Vec<OrderId> {
        self.state
            .lock()
            .txids
            .get(txid)
            .cloned()
            .unwrap_or_default()
    }

    fn record_link(&self, key: &RecordKey) -> Option<OrderId> {
        self.state.lock().record_links.get(key).copied()
    }

    fn link_record(&self, key: RecordKey, id: OrderId) -> StoreResult<()> {
        let mut st = self.state.lock();
        if !st.orders.contains_key(&id) {
            return Err(StoreError::UnknownOrder(id));
        }
        match st.record_links.get(&key) {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(StoreError::DuplicateRecord {
                key,
                existing: *existing,
            }),
            None => {
                st.record_links.insert(key, id);
                Ok(())
            }
        }
    }

    fn cursor(&self) -> Option<BlockNumber> {
        self.state.lock().cursor
    }

    fn set_cursor(&self, bn: BlockNumber) {
        self.state.lock().cursor = Some(bn);
    }

    fn block_hash(&self, bn: BlockNumber) -> Option<String> {
        self.state.lock().block_hashes.get(&bn).cloned()
    }

    fn put_block_hash(&self, bn: BlockNumber, hash: String) {
        self.state.lock().block_hashes.insert(bn, hash);
    }

    fn remove_block_hashes_from(&self, height: BlockNumber) {
        let mut st = self.state.lock();
        let _ = st.block_hashes.split_off(&height);
    }

    fn prune_block_hashes(&self, below: BlockNumber) {
        let mut st = self.state.lock();
        let kept = st.block_hashes.split_off(&below);
        st.block_hashes = kept;
    }

    fn push_intervention(&self, record: ManualIntervention) {
        self.state.lock().interventions.push(record);
    }

    fn interventions(&self) -> Vec<ManualIntervention> {
        self.state.lock().interventions.clone()
    }

    fn ruler_data(&self) -> Option<serde_json::Value> {
        self.state.lock().ruler_data.clone()
    }

    fn set_ruler_data(&self, data: serde_json::Value) {
        self.state.lock().ruler_data = Some(data);
    }

    fn set_addresses(&self, addresses: Vec<IssuedAddress>) {
        self.state.lock().addresses = addresses;
    }

    fn addresses(&self) -> Vec<IssuedAddress> {
        self.state.lock().addresses.clone()
    }
}
