//! Await plans and dependency readiness.

use custody_core::{AwaitPlan, BlockNumber, OrderId, OrderStatus, TrackedOrder};
use custody_store::LedgerStore;

/// Why a pending order may or may not broadcast now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Waiting on an await plan.
    Deferred(AwaitPlan),
    /// A dependency is not confirmed.
    Blocked,
    /// A dependency can no longer confirm: rejected, failed, or still rolled
    /// back once the await plan has run out.
    Orphaned(OrderId),
}

/// True once `plan` no longer holds the order back at `bn`.
pub fn plan_satisfied(plan: &AwaitPlan, bn: BlockNumber, store: &dyn LedgerStore) -> bool {
    match plan {
        AwaitPlan::UntilHeight { height } => bn >= *height,
        AwaitPlan::UntilConfirmed { order_id } => store
            .order(*order_id)
            .is_some_and(|o| o.status == OrderStatus::Confirmed),
    }
}

pub fn dependencies_confirmed(order: &TrackedOrder, store: &dyn LedgerStore) -> bool {
    order.depends_on.iter().all(|id| {
        store
            .order(*id)
            .is_some_and(|dep| dep.status == OrderStatus::Confirmed)
    })
}

/// First dependency that will never confirm.
pub fn lost_dependency(order: &TrackedOrder, store: &dyn LedgerStore) -> Option<OrderId> {
    order.depends_on.iter().copied().find(|id| {
        store.order(*id).map_or(true, |dep| {
            dep.status.is_final() || dep.status == OrderStatus::RolledBack
        })
    })
}

/// Await plans are checked first, so a rolled-back dependency only counts as
/// lost once the reorg window has re-stabilised.
pub fn readiness(order: &TrackedOrder, bn: BlockNumber, store: &dyn LedgerStore) -> Readiness {
    if let Some(plan) = &order.await_plan {
        if !plan_satisfied(plan, bn, store) {
            return Readiness::Deferred(*plan);
        }
    }
    if let Some(dep) = lost_dependency(order, store) {
        return Readiness::Orphaned(dep);
    }
    if !dependencies_confirmed(order, store) {
        return Readiness::Blocked;
    }
    Readiness::Ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{DisplayAmount, Order, OrderId, OrderKind};
    use custody_store::MemoryStore;
    use rust_decimal_macros::dec;

    fn pending(store: &MemoryStore, kind: OrderKind) -> TrackedOrder {
        let order = Order::new(store.next_order_id(), "dep1", "hot1", DisplayAmount::new(dec!(1)));
        let tracked = TrackedOrder::new_outgoing(order, kind, "eth");
        store.insert_order(tracked.clone()).unwrap();
        tracked
    }

    #[test]
    fn test_until_height() {
        let store = MemoryStore::new();
        let plan = AwaitPlan::UntilHeight { height: 110 };
        assert!(!plan_satisfied(&plan, 109, &store));
        assert!(plan_satisfied(&plan, 110, &store));
    }

    #[test]
    fn test_until_confirmed_and_dependencies() {
        let store = MemoryStore::new();
        let dep = pending(&store, OrderKind::Withdraw);
        let mut sweep = pending(&store, OrderKind::SweepToHot);
        sweep.depends_on = vec![dep.id()];
        sweep.await_plan = Some(AwaitPlan::UntilConfirmed { order_id: dep.id() });

        assert!(matches!(readiness(&sweep, 100, &store), Readiness::Deferred(_)));

        store
            .update_order(dep.id(), &mut |o| {
                o.status = OrderStatus::Confirmed;
                Ok(())
            })
            .unwrap();
        assert_eq!(readiness(&sweep, 100, &store), Readiness::Ready);

        sweep.await_plan = None;
        let second = pending(&store, OrderKind::Withdraw);
        sweep.depends_on.push(second.id());
        assert_eq!(readiness(&sweep, 100, &store), Readiness::Blocked);

        sweep.depends_on.push(OrderId(99));
        assert_eq!(readiness(&sweep, 100, &store), Readiness::Orphaned(OrderId(99)));
    }

    #[test]
    fn test_rolled_back_dependency_waits_for_plan() {
        let store = MemoryStore::new();
        let dep = pending(&store, OrderKind::Withdraw);
        store
            .update_order(dep.id(), &mut |o| {
                o.status = OrderStatus::RolledBack;
                Ok(())
            })
            .unwrap();
        let mut sweep = pending(&store, OrderKind::SweepToHot);
        sweep.depends_on = vec![dep.id()];
        sweep.await_plan = Some(AwaitPlan::UntilHeight { height: 110 });

        assert!(matches!(readiness(&sweep, 105, &store), Readiness::Deferred(_)));
        assert_eq!(readiness(&sweep, 110, &store), Readiness::Orphaned(dep.id()));
    }
}
