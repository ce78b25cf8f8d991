//! Core domain types for the custody reconciliation engine.
//!
//! This crate provides the types shared by every other crate in the workspace:
//! - `DisplayAmount`, `RawAmount`: decimal-adjusted vs raw-unit amounts
//! - `Order`, `TrackedOrder`, `OrderStatus`: the order lifecycle
//! - `IncomingRecord`, `RecordKey`: classified scan output and its dedup key
//! - `OrderState`, `OrdersUpdateResult`, `AwaitPlan`: chain observations and
//!   broadcast results
//! - `Address`, `IssuedAddress`: system-owned addresses

pub mod address;
pub mod amount;
pub mod chain;
pub mod error;
pub mod lifecycle;
pub mod order;
pub mod record;
pub mod result;
pub mod stake;
pub mod wallet;

pub use address::{
    Address, AddressOwner, AddressRole, AddressState, AddressType, BizMode, IssuedAddress,
    SystemAddressKind,
};
pub use amount::{DisplayAmount, RawAmount, MAX_DECIMALS};
pub use chain::{
    BlockNumber, BlockResult, ChainIdentity, ChainKey, OrderInfo, TxData, TxEndpoint, TxRef,
    TxResult, ValidationOutcome, DEFAULT_VALIDATION_ERROR_CODE,
};
pub use error::{CoreError, Result};
pub use lifecycle::{
    AuditEntry, InterventionReason, ManualIntervention, NotiState, OrderStatus, StateResult,
    TrackedOrder,
};
pub use order::{Order, OrderId, OrderKind};
pub use record::{IncomingRecord, RecordClass, RecordKey};
pub use result::{AwaitPlan, OrderState, OrdersUpdateResult, SweepOrderResult};
pub use stake::{
    Commission, DelegationInfo, DelegationReward, UnstakingDelegationEntry,
    UnstakingDelegationInfo, ValidatorInfo, ValidatorStatus,
};
pub use wallet::WalletStatus;
