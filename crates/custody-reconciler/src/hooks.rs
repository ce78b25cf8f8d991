//! Business hooks around order notification.
//!
//! [`OrderHooks`] is the injectable business side; every method has a no-op
//! default. [`HookRunner`] is the envelope the reconciler calls: it logs and
//! counts hook errors and never lets them reach order state.

use std::sync::Arc;

use tracing::warn;

use custody_chain::BoxFuture;
use custody_core::{BlockNumber, NotiState, OrderId, OrderStatus, StateResult, TrackedOrder};
use custody_telemetry::Metrics;

use crate::policy::ConfirmationPolicy;

/// Host-provided order hooks.
pub trait OrderHooks: Send + Sync {
    /// Called before a status change is applied.
    fn noti_pre_hook<'a>(
        &'a self,
        _order: &'a TrackedOrder,
        _next: OrderStatus,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Called after a status change was committed.
    fn noti_after_hook<'a>(&'a self, _order: &'a TrackedOrder) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Decide the order state at `bn`. `None` uses the confirmation policy.
    fn noti_state_hook<'a>(
        &'a self,
        _order: &'a TrackedOrder,
        _bn: BlockNumber,
        _delta: u64,
    ) -> BoxFuture<'a, anyhow::Result<Option<StateResult>>> {
        Box::pin(async { Ok(None) })
    }

    fn is_order_failed_critical<'a>(
        &'a self,
        _order: &'a TrackedOrder,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    /// A replacement order that supersedes `order`, if any.
    fn find_overrided_order<'a>(
        &'a self,
        _order: &'a TrackedOrder,
    ) -> BoxFuture<'a, anyhow::Result<Option<OrderId>>> {
        Box::pin(async { Ok(None) })
    }
}

/// Hooks that keep every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOrderHooks;

impl OrderHooks for DefaultOrderHooks {}

/// Error-isolating envelope around [`OrderHooks`].
#[derive(Clone)]
pub struct HookRunner {
    chain: String,
    hooks: Arc<dyn OrderHooks>,
    policy: ConfirmationPolicy,
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRunner")
            .field("chain", &self.chain)
            .field("policy", &self.policy)
            .finish()
    }
}

impl HookRunner {
    pub fn new(chain: impl Into<String>, hooks: Arc<dyn OrderHooks>, policy: ConfirmationPolicy) -> Self {
        Self {
            chain: chain.into(),
            hooks,
            policy,
        }
    }

    fn failed(&self, hook: &'static str, order: &TrackedOrder, err: &anyhow::Error) {
        warn!(
            chain = %self.chain,
            order_id = %order.id(),
            hook,
            error = %err,
            "Hook failed, order state unaffected"
        );
        Metrics::hook_failure(&self.chain, hook);
    }

    pub async fn pre(&self, order: &TrackedOrder, next: OrderStatus) {
        if let Err(e) = self.hooks.noti_pre_hook(order, next).await {
            self.failed("noti_pre_hook", order, &e);
        }
    }

    pub async fn after(&self, order: &TrackedOrder) {
        if let Err(e) = self.hooks.noti_after_hook(order).await {
            self.failed("noti_after_hook", order, &e);
        }
    }

    /// Hook decision, falling back to the policy on `None` or error.
    pub async fn state(
        &self,
        order: &TrackedOrder,
        bn: BlockNumber,
        delta: u64,
        reported: Option<NotiState>,
    ) -> StateResult {
        match self.hooks.noti_state_hook(order, bn, delta).await {
            Ok(Some(result)) => result,
            Ok(None) => self.policy.default_state(order, bn, delta, reported),
            Err(e) => {
                self.failed("noti_state_hook", order, &e);
                self.policy.default_state(order, bn, delta, reported)
            }
        }
    }

    pub async fn is_failed_critical(&self, order: &TrackedOrder) -> bool {
        match self.hooks.is_order_failed_critical(order).await {
            Ok(critical) => critical,
            Err(e) => {
                self.failed("is_order_failed_critical", order, &e);
                false
            }
        }
    }

    pub async fn overriding_order(&self, order: &TrackedOrder) -> Option<OrderId> {
        match self.hooks.find_overrided_order(order).await {
            Ok(Some(id)) if id != order.id() => Some(id),
            Ok(_) => None,
            Err(e) => {
                self.failed("find_overrided_order", order, &e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{DisplayAmount, Order, OrderKind};
    use rust_decimal_macros::dec;

    struct FailingHooks;

    impl OrderHooks for FailingHooks {
        fn noti_state_hook<'a>(
            &'a self,
            _order: &'a TrackedOrder,
            _bn: BlockNumber,
            _delta: u64,
        ) -> BoxFuture<'a, anyhow::Result<Option<StateResult>>> {
            Box::pin(async { Err(anyhow::anyhow!("callback endpoint down")) })
        }

        fn is_order_failed_critical<'a>(
            &'a self,
            _order: &'a TrackedOrder,
        ) -> BoxFuture<'a, anyhow::Result<bool>> {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        }

        fn find_overrided_order<'a>(
            &'a self,
            order: &'a TrackedOrder,
        ) -> BoxFuture<'a, anyhow::Result<Option<OrderId>>> {
            let id = order.id();
            Box::pin(async move { Ok(Some(id)) })
        }
    }

    fn order_at_block(block: BlockNumber) -> TrackedOrder {
        let order = Order::new(OrderId(1), "hot1", "userA", DisplayAmount::new(dec!(10)));
        let mut o = TrackedOrder::new_outgoing(order, OrderKind::Withdraw, "eth");
        o.txid = Some("abc".to_string());
        o.block = Some(block);
        o
    }

    #[tokio::test]
    async fn test_default_hooks_follow_policy() {
        let runner = HookRunner::new("eth", Arc::new(DefaultOrderHooks), ConfirmationPolicy::default());
        let order = order_at_block(100);
        assert_eq!(
            runner.state(&order, 100, 0, None).await,
            StateResult::new(NotiState::Pending, false)
        );
        assert_eq!(
            runner.state(&order, 106, 6, None).await,
            StateResult::new(NotiState::Confirmed, false)
        );
    }

    #[tokio::test]
    async fn test_hook_errors_are_isolated() {
        let runner = HookRunner::new("eth", Arc::new(FailingHooks), ConfirmationPolicy::default());
        let order = order_at_block(100);
        assert_eq!(runner.state(&order, 106, 6, None).await.state, NotiState::Confirmed);
        assert!(!runner.is_failed_critical(&order).await);
        // an order cannot supersede itself
        assert_eq!(runner.overriding_order(&order).await, None);
    }
}
