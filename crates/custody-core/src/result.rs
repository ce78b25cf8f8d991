//! Chain observations and broadcast results.

use serde::{Deserialize, Serialize};

use crate::amount::DisplayAmount;
use crate::chain::BlockNumber;
use crate::lifecycle::NotiState;
use crate::order::OrderId;

/// Point-in-time observation of an order on chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderState {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<DisplayAmount>,
    /// Chain-reported state, when the chain reports one (e.g. reverted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NotiState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_results: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OrderState {
    #[must_use]
    pub fn not_found() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn found_at(block: BlockNumber) -> Self {
        Self {
            found: true,
            block: Some(block),
            ..Self::default()
        }
    }

    /// `max(bn - block, 0)`; zero while not yet included.
    #[must_use]
    pub fn confirmations_at(&self, bn: BlockNumber) -> u64 {
        match (self.found, self.block) {
            (true, Some(block)) => bn.saturating_sub(block),
            _ => 0,
        }
    }
}

/// Typed continuation attached to a rollback result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AwaitPlan {
    /// Wait until the scanned tip reaches `height`.
    UntilHeight { height: BlockNumber },
    /// Wait until the referenced order is confirmed.
    UntilConfirmed { order_id: OrderId },
}

/// Result of broadcasting one transaction covering one or more orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersUpdateResult {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    #[serde(default)]
    pub rollback: bool,
    pub order_ids: Vec<OrderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_results: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_plan: Option<AwaitPlan>,
}

impl OrdersUpdateResult {
    #[must_use]
    pub fn new(txid: impl Into<String>, order_ids: Vec<OrderId>) -> Self {
        Self {
            txid: txid.into(),
            meta: None,
            rollback: false,
            order_ids,
            action_memo: None,
            action_results: None,
            await_plan: None,
        }
    }

    /// The await plan, honoured only on rollback results.
    #[must_use]
    pub fn effective_await_plan(&self) -> Option<AwaitPlan> {
        if self.rollback {
            self.await_plan
        } else {
            None
        }
    }
}

/// Broadcast result of a sweep, with the swept destination and value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOrderResult {
    #[serde(flatten)]
    pub update: OrdersUpdateResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DisplayAmount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_confirmations_saturate() {
        let st = OrderState::found_at(100);
        assert_eq!(st.confirmations_at(100), 0);
        assert_eq!(st.confirmations_at(106), 6);
        assert_eq!(st.confirmations_at(90), 0);
        assert_eq!(OrderState::not_found().confirmations_at(500), 0);
    }

    #[test]
    fn test_await_plan_requires_rollback() {
        let mut res = OrdersUpdateResult::new("abc", vec![OrderId(1)]);
        res.await_plan = Some(AwaitPlan::UntilHeight { height: 120 });
        assert_eq!(res.effective_await_plan(), None);
        res.rollback = true;
        assert_eq!(
            res.effective_await_plan(),
            Some(AwaitPlan::UntilHeight { height: 120 })
        );
    }

    #[test]
    fn test_sweep_result_flattens() {
        let res = SweepOrderResult {
            update: OrdersUpdateResult::new("s1", vec![OrderId(3), OrderId(4)]),
            to: Some("hot1".to_string()),
            value: Some(DisplayAmount::new(dec!(2))),
        };
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["txid"], "s1");
        assert_eq!(json["orderIds"], serde_json::json!([3, 4]));
        assert_eq!(json["to"], "hot1");
    }
}
