//! Chain adapter capability interface.
//!
//! # Key Components
//!
//! - [`ChainAdapter`]: per-chain ledger capabilities (scan, validate, broadcast)
//! - [`StakeHandler`]: optional delegation capabilities
//! - [`ChainHandlers`]: default handler plus per-core-type handlers of one chain
//! - [`ChainRegistry`]: chains selected at startup by [`custody_core::ChainKey`]
//! - [`SimulatedChain`]: in-memory chain for simulation and tests

pub mod adapter;
pub mod error;
pub mod handlers;
pub mod simulated;

pub use adapter::{
    AddressRequest, BoxFuture, ChainAdapter, DynChainAdapter, DynStakeHandler, KeyMode,
    StakeHandler,
};
pub use error::{ChainError, ChainResult};
pub use handlers::{ChainHandlers, ChainRegistry};
pub use simulated::{BroadcastRecord, SimFailure, SimOp, SimOutput, SimTx, SimulatedChain};
