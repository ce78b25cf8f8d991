//! Order reconciliation engine.
//!
//! # Key Components
//!
//! - [`OrderReconciler`]: owns every order status change of one chain
//! - [`ConfirmationPolicy`]: confirmation threshold, reorg window, resend limits
//! - [`OrderHooks`] / [`HookRunner`]: business hooks around notifications
//! - [`BroadcastLocks`]: one broadcast in flight per order or source address
//! - [`StakeCoordinator`]: delegation orders and stake queries
//!
//! # Lifecycle
//!
//! ```text
//! enqueue -> settle (broadcast) -> apply_records / notify_orders -> confirmed
//!                                        |
//!                          rollback_from (reorg) -> rolled-back -> seen again
//! ```

pub mod deferred;
pub mod error;
pub mod hooks;
pub mod locks;
pub mod policy;
pub mod reconciler;
pub mod stake;

pub use deferred::{dependencies_confirmed, plan_satisfied, readiness, Readiness};
pub use error::{ReconcileError, ReconcileResult};
pub use hooks::{DefaultOrderHooks, HookRunner, OrderHooks};
pub use locks::{BroadcastGuard, BroadcastLocks, LockKey};
pub use policy::ConfirmationPolicy;
pub use reconciler::{
    DispatchOutcome, OrderDraft, OrderReconciler, RollbackReport, SettleReport,
};
pub use stake::{StakeCoordinator, StakeSubmission};
