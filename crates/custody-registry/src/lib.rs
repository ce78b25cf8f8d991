//! System address registry.
//!
//! - [`AddressRegistry`]: `(coin, address)` to ownership metadata; hot/cold/deposit
//!   membership queries
//! - [`SystemAddressCache`]: hot/cold addresses per coin, invalidated only by rotation
//! - [`SeedVault`]: key material used for address derivation

pub mod error;
pub mod registry;
pub mod seed;
pub mod system_cache;

pub use error::{RegistryError, RegistryResult};
pub use registry::AddressRegistry;
pub use seed::{KeySource, SeedVault};
pub use system_cache::{SystemAddressCache, SystemCacheEntry};
