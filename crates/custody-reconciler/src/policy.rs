//! Confirmation and resend policy.

use serde::{Deserialize, Serialize};

use custody_core::{BlockNumber, NotiState, StateResult, TrackedOrder};

/// Per-chain thresholds that drive the order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    /// `delta >= confirmations` confirms an order.
    pub confirmations: u64,
    /// Deepest reorg that is rolled back automatically.
    pub max_reorg_depth: u64,
    /// Blocks a broadcast may stay unseen before a resend is requested.
    pub drop_timeout_blocks: u64,
    /// Resends beyond this make the order failed-critical.
    pub max_send_attempts: u32,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmations: 6,
            max_reorg_depth: 64,
            drop_timeout_blocks: 20,
            max_send_attempts: 3,
        }
    }
}

impl ConfirmationPolicy {
    #[inline]
    #[must_use]
    pub fn is_confirmed(&self, delta: u64) -> bool {
        delta >= self.confirmations
    }

    /// Height a dependent must wait for after a reorg at `height`.
    #[must_use]
    pub fn restabilised_at(&self, height: BlockNumber) -> BlockNumber {
        height.saturating_add(self.confirmations)
    }

    /// State used when no business hook overrides it.
    ///
    /// `reported` is the chain-reported state of the latest observation.
    #[must_use]
    pub fn default_state(
        &self,
        order: &TrackedOrder,
        bn: BlockNumber,
        delta: u64,
        reported: Option<NotiState>,
    ) -> StateResult {
        if reported == Some(NotiState::Failed) {
            return StateResult::new(NotiState::Failed, false);
        }
        if order.block.is_some() {
            if self.is_confirmed(delta) {
                return StateResult::new(NotiState::Confirmed, false);
            }
            return StateResult::new(NotiState::Pending, false);
        }
        let dropped = order.kind.is_outgoing()
            && order
                .broadcast_at_bn
                .is_some_and(|at| bn.saturating_sub(at) > self.drop_timeout_blocks);
        StateResult::new(NotiState::Pending, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{DisplayAmount, Order, OrderId, OrderKind};
    use rust_decimal_macros::dec;

    fn withdraw_at(block: Option<BlockNumber>) -> TrackedOrder {
        let order = Order::new(OrderId(1), "hot1", "userA", DisplayAmount::new(dec!(10)));
        let mut o = TrackedOrder::new_outgoing(order, OrderKind::Withdraw, "eth");
        o.txid = Some("abc".to_string());
        o.block = block;
        o.broadcast_at_bn = Some(99);
        o
    }

    #[test]
    fn test_threshold_scenario() {
        let policy = ConfirmationPolicy::default();
        let order = withdraw_at(Some(100));
        assert_eq!(
            policy.default_state(&order, 100, 0, None),
            StateResult::new(NotiState::Pending, false)
        );
        assert_eq!(
            policy.default_state(&order, 106, 6, None),
            StateResult::new(NotiState::Confirmed, false)
        );
    }

    #[test]
    fn test_resend_after_drop_timeout() {
        let policy = ConfirmationPolicy::default();
        let order = withdraw_at(None);
        assert!(!policy.default_state(&order, 119, 0, None).send_again);
        assert!(policy.default_state(&order, 120, 0, None).send_again);
    }

    #[test]
    fn test_deposit_never_resends() {
        let policy = ConfirmationPolicy::default();
        let mut order = withdraw_at(None);
        order.kind = OrderKind::Deposit;
        assert!(!policy.default_state(&order, 500, 0, None).send_again);
    }

    #[test]
    fn test_reported_failure_wins() {
        let policy = ConfirmationPolicy::default();
        let order = withdraw_at(Some(100));
        assert_eq!(
            policy.default_state(&order, 200, 100, Some(NotiState::Failed)).state,
            NotiState::Failed
        );
    }
}
