//! Order lifecycle: status machine, tracked orders and audit history.
//!
//! ```text
//! pending -> broadcasting -> seen -> confirmed
//!    |            |            |         |
//!    +-> rejected / failed-critical      +-> rolled-back (reorg window only)
//! ```
//!
//! `rejected` and `failed-critical` are final. `confirmed` only leaves via an
//! explicit rollback; every other change to a final order is an annotation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::amount::DisplayAmount;
use crate::chain::{BlockNumber, OrderInfo};
use crate::error::{CoreError, Result};
use crate::order::{Order, OrderId, OrderKind};
use crate::record::{IncomingRecord, RecordClass, RecordKey};
use crate::result::{AwaitPlan, OrderState};

// ============================================================================
// Status
// ============================================================================

/// Reconciler-owned order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    /// Created, not yet submitted.
    #[default]
    Pending,
    /// Submitted to the adapter, no txid acknowledged yet.
    Broadcasting,
    /// Txid known; waiting for confirmations.
    Seen,
    Confirmed,
    Rejected,
    /// Frozen pending manual intervention.
    FailedCritical,
    /// Reverted by a reorg.
    RolledBack,
}

impl OrderStatus {
    /// Returns true if no further automatic progress happens.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::FailedCritical)
    }

    /// Returns true if the status can never change again.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Rejected | Self::FailedCritical)
    }

    /// Returns true while the order has (or may have) a transaction in flight.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Broadcasting | Self::Seen | Self::RolledBack)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use OrderStatus::*;
        matches!(
            (*self, next),
            (Pending, Broadcasting | Rejected | FailedCritical)
                | (Broadcasting, Seen | Pending | Rejected | FailedCritical)
                | (Seen, Confirmed | Pending | Rejected | FailedCritical | RolledBack)
                | (Confirmed, RolledBack)
                | (RolledBack, Seen | Pending | Rejected | FailedCritical)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Broadcasting => "broadcasting",
            Self::Seen => "seen",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::FailedCritical => "failed-critical",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(s)
    }
}

/// State reported by the notification hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotiState {
    Pending,
    Confirmed,
    Failed,
}

/// Output of `noti_state_hook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResult {
    pub state: NotiState,
    /// Force a re-issue of the transaction.
    pub send_again: bool,
}

impl StateResult {
    #[must_use]
    pub fn new(state: NotiState, send_again: bool) -> Self {
        Self { state, send_again }
    }
}

// ============================================================================
// Audit
// ============================================================================

/// One entry of an order's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    /// `None` for the creation entry.
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bn: Option<BlockNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Why a manual-intervention record was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionReason {
    FailedCritical,
    /// Broadcast timed out; the transaction may or may not exist.
    BroadcastOutcomeUnknown,
    /// Reorg deeper than the configured window.
    UnrecoverableReorg,
    SpecialRecord,
}

impl fmt::Display for InterventionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailedCritical => "failed_critical",
            Self::BroadcastOutcomeUnknown => "broadcast_outcome_unknown",
            Self::UnrecoverableReorg => "unrecoverable_reorg",
            Self::SpecialRecord => "special_record",
        };
        f.write_str(s)
    }
}

/// Record requiring an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualIntervention {
    pub id: Uuid,
    pub order_id: OrderId,
    pub reason: InterventionReason,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ManualIntervention {
    #[must_use]
    pub fn new(order_id: OrderId, reason: InterventionReason, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            reason,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Tracked Order
// ============================================================================

/// An order plus everything the reconciler knows about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order: Order,
    pub kind: OrderKind,
    pub coin_name: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub meta: Option<String>,
    /// Output index of the transfer inside `txid`.
    #[serde(default)]
    pub n: u32,
    /// Inclusion block of the best observation.
    #[serde(default)]
    pub block: Option<BlockNumber>,
    #[serde(default)]
    pub fee: Option<DisplayAmount>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub broadcast_at_bn: Option<BlockNumber>,
    #[serde(default)]
    pub send_attempts: u32,
    #[serde(default)]
    pub action_results: Option<Vec<String>>,
    #[serde(default)]
    pub message: Option<String>,
    /// Orders that must be confirmed before this one may broadcast.
    #[serde(default)]
    pub depends_on: Vec<OrderId>,
    /// Sweep order that moved this deposit's funds.
    #[serde(default)]
    pub settled_by: Option<OrderId>,
    /// Continuation that must be satisfied before the order may broadcast.
    #[serde(default)]
    pub await_plan: Option<AwaitPlan>,
    #[serde(default)]
    pub record: Option<RecordKey>,
    #[serde(default)]
    pub class: Option<RecordClass>,
    #[serde(default)]
    pub history: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedOrder {
    /// A new outgoing order in `Pending`.
    #[must_use]
    pub fn new_outgoing(order: Order, kind: OrderKind, coin_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            order,
            kind,
            coin_name: coin_name.into(),
            status: OrderStatus::Pending,
            txid: None,
            meta: None,
            n: 0,
            block: None,
            fee: None,
            confirmations: 0,
            broadcast_at_bn: None,
            send_attempts: 0,
            action_results: None,
            message: None,
            depends_on: Vec::new(),
            settled_by: None,
            await_plan: None,
            record: None,
            class: None,
            history: vec![AuditEntry {
                at: now,
                from: None,
                to: OrderStatus::Pending,
                bn: None,
                note: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// A deposit order created from a scanned record, already `Seen`.
    #[must_use]
    pub fn from_record(id: OrderId, record: &IncomingRecord) -> Self {
        let now = Utc::now();
        let mut order = Order::new(
            id,
            record.from_address.clone(),
            record.to_address.clone(),
            record.value,
        );
        order.action = record.action.clone();
        order.action_memo = record.action_memo.clone();
        Self {
            order,
            kind: OrderKind::Deposit,
            coin_name: record.coin_name.clone(),
            status: OrderStatus::Seen,
            txid: Some(record.txid.clone()),
            meta: record.meta.clone(),
            n: record.n,
            block: Some(record.bn),
            fee: None,
            confirmations: 0,
            broadcast_at_bn: None,
            send_attempts: 0,
            action_results: record.action_results.clone(),
            message: None,
            depends_on: Vec::new(),
            settled_by: None,
            await_plan: None,
            record: Some(record.key()),
            class: Some(record.class()),
            history: vec![AuditEntry {
                at: now,
                from: None,
                to: OrderStatus::Seen,
                bn: Some(record.bn),
                note: Some(format!("scanned {}", record.class())),
            }],
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn id(&self) -> OrderId {
        self.order.id
    }

    /// Apply a checked status change and append it to the history.
    pub fn transition(
        &mut self,
        to: OrderStatus,
        bn: Option<BlockNumber>,
        note: Option<String>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                order_id: self.id(),
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.history.push(AuditEntry {
            at: now,
            from: Some(self.status),
            to,
            bn,
            note,
        });
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Record a note without changing status. Allowed in every state.
    pub fn annotate(&mut self, bn: Option<BlockNumber>, note: impl Into<String>) {
        let note = note.into();
        let now = Utc::now();
        self.history.push(AuditEntry {
            at: now,
            from: Some(self.status),
            to: self.status,
            bn,
            note: Some(note.clone()),
        });
        self.message = Some(note);
        self.updated_at = now;
    }

    /// Fold a chain observation taken at `bn`.
    ///
    /// Keeps the observation with the highest confirmation count, so a late
    /// response can never lower confirmations. Returns true if applied.
    pub fn fold_observation(&mut self, state: &OrderState, bn: BlockNumber) -> bool {
        if !state.found {
            if let Some(msg) = &state.message {
                self.message = Some(msg.clone());
            }
            return false;
        }
        let confirmations = state.confirmations_at(bn);
        if self.block.is_some() && confirmations < self.confirmations {
            return false;
        }
        if let Some(block) = state.block {
            self.block = Some(block);
        }
        if state.fee.is_some() {
            self.fee = state.fee;
        }
        if state.action_results.is_some() {
            self.action_results = state.action_results.clone();
        }
        if state.message.is_some() {
            self.message = state.message.clone();
        }
        self.confirmations = confirmations;
        self.updated_at = Utc::now();
        true
    }

    /// Confirmations at `bn` from the stored inclusion block.
    #[must_use]
    pub fn confirmations_at(&self, bn: BlockNumber) -> u64 {
        self.block.map_or(0, |b| bn.saturating_sub(b))
    }

    /// Clear inclusion data after a reorg.
    pub fn reset_for_rollback(&mut self) {
        self.block = None;
        self.confirmations = 0;
        self.fee = None;
    }

    /// Lookup descriptor for the adapter; `None` before a txid exists.
    #[must_use]
    pub fn order_info(&self) -> Option<OrderInfo> {
        let txid = self.txid.clone()?;
        Some(OrderInfo {
            txid,
            meta: self.meta.clone(),
            coin_name: self.coin_name.clone(),
            n: self.n,
            from: self.order.from.clone(),
            to: self.order.to.clone(),
            value: self.order.value,
            block: self.block,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn withdraw() -> TrackedOrder {
        let order = Order::new(OrderId(1), "hot1", "userA", DisplayAmount::new(dec!(10)));
        TrackedOrder::new_outgoing(order, OrderKind::Withdraw, "eth")
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut o = withdraw();
        o.transition(OrderStatus::Broadcasting, Some(99), None).unwrap();
        o.transition(OrderStatus::Seen, Some(99), None).unwrap();
        o.transition(OrderStatus::Confirmed, Some(106), None).unwrap();
        assert_eq!(o.status, OrderStatus::Confirmed);
        assert_eq!(o.history.len(), 4);
        assert_eq!(o.history[3].from, Some(OrderStatus::Seen));
    }

    #[test]
    fn test_final_states_do_not_move() {
        for status in [OrderStatus::Rejected, OrderStatus::FailedCritical] {
            for next in [
                OrderStatus::Pending,
                OrderStatus::Broadcasting,
                OrderStatus::Seen,
                OrderStatus::Confirmed,
                OrderStatus::RolledBack,
            ] {
                assert!(!status.can_transition_to(next), "{status} -> {next}");
            }
        }
    }

    #[test]
    fn test_confirmed_only_rolls_back() {
        let c = OrderStatus::Confirmed;
        assert!(c.can_transition_to(OrderStatus::RolledBack));
        assert!(!c.can_transition_to(OrderStatus::FailedCritical));
        assert!(!c.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn test_illegal_transition_is_error() {
        let mut o = withdraw();
        let err = o.transition(OrderStatus::Confirmed, None, None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(o.status, OrderStatus::Pending);
    }

    #[test]
    fn test_fold_keeps_highest_confirmation() {
        let mut o = withdraw();
        assert!(o.fold_observation(&OrderState::found_at(100), 104));
        assert_eq!(o.confirmations, 4);
        // slower response computed against an older tip
        assert!(!o.fold_observation(&OrderState::found_at(100), 102));
        assert_eq!(o.confirmations, 4);
        assert!(o.fold_observation(&OrderState::found_at(100), 106));
        assert_eq!(o.confirmations, 6);
        assert!(!o.fold_observation(&OrderState::not_found(), 107));
        assert_eq!(o.block, Some(100));
    }

    #[test]
    fn test_annotate_keeps_status() {
        let mut o = withdraw();
        o.annotate(Some(5), "operator note");
        assert_eq!(o.status, OrderStatus::Pending);
        assert_eq!(o.message.as_deref(), Some("operator note"));
    }

    #[test]
    fn test_order_info_requires_txid() {
        let mut o = withdraw();
        assert!(o.order_info().is_none());
        o.txid = Some("abc".to_string());
        let info = o.order_info().unwrap();
        assert_eq!(info.txid, "abc");
        assert_eq!(info.to, "userA");
    }
}
