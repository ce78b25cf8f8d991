//! Ledger persistence.
//!
//! - [`LedgerStore`]: the store seam used by the scanner and reconciler
//! - [`MemoryStore`]: in-memory implementation with JSON snapshots
//! - [`JournalWriter`]: append-only JSON Lines audit journal

pub mod error;
pub mod journal;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use journal::{JournalEntry, JournalWriter};
pub use store::{LedgerStore, MemoryStore, OrderMutation, Snapshot, SNAPSHOT_VERSION};
