//! Delegation operations.
//!
//! Submissions become tracked orders and follow the normal lifecycle; queries
//! read through to the chain's stake handler.

use std::sync::Arc;

use tracing::info;

use custody_chain::DynStakeHandler;
use custody_core::{
    DelegationInfo, DelegationReward, DisplayAmount, OrderId, OrderKind, UnstakingDelegationInfo,
    ValidatorInfo,
};

use crate::error::{ReconcileError, ReconcileResult};
use crate::reconciler::{DispatchOutcome, OrderDraft, OrderReconciler};

/// Order created for a stake operation and its first dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeSubmission {
    pub order_id: OrderId,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone)]
pub struct StakeCoordinator {
    reconciler: Arc<OrderReconciler>,
}

impl StakeCoordinator {
    pub fn new(reconciler: Arc<OrderReconciler>) -> Self {
        Self { reconciler }
    }

    fn handler(&self) -> ReconcileResult<DynStakeHandler> {
        self.reconciler
            .handlers()
            .get_stake_handler()
            .ok_or_else(|| ReconcileError::NoStakeHandler(self.reconciler.chain().to_string()))
    }

    async fn submit(&self, draft: OrderDraft) -> ReconcileResult<StakeSubmission> {
        self.handler()?;
        let kind = draft.kind;
        let order = self.reconciler.enqueue(draft).await?;
        let outcome = self
            .reconciler
            .dispatch(order.id(), self.reconciler.current_bn())
            .await?;
        info!(
            chain = %self.reconciler.chain(),
            order_id = %order.id(),
            kind = %kind,
            outcome = ?outcome,
            "Stake order submitted"
        );
        Ok(StakeSubmission {
            order_id: order.id(),
            outcome,
        })
    }

    pub async fn submit_delegation(
        &self,
        coin_name: &str,
        delegator: &str,
        validator: &str,
        value: DisplayAmount,
    ) -> ReconcileResult<StakeSubmission> {
        self.submit(OrderDraft::new(OrderKind::Delegate, coin_name, delegator, validator, value))
            .await
    }

    pub async fn submit_un_delegation(
        &self,
        coin_name: &str,
        delegator: &str,
        validator: &str,
        value: DisplayAmount,
    ) -> ReconcileResult<StakeSubmission> {
        self.submit(OrderDraft::new(OrderKind::Undelegate, coin_name, delegator, validator, value))
            .await
    }

    /// Move `value` of stake from `src_validator` to `dst_validator`.
    pub async fn submit_re_delegation(
        &self,
        coin_name: &str,
        delegator: &str,
        src_validator: &str,
        dst_validator: &str,
        value: DisplayAmount,
    ) -> ReconcileResult<StakeSubmission> {
        let draft = OrderDraft::new(OrderKind::Redelegate, coin_name, delegator, dst_validator, value)
            .with_args(vec![src_validator.to_string(), dst_validator.to_string()]);
        self.submit(draft).await
    }

    pub async fn claim_reward(
        &self,
        coin_name: &str,
        delegator: &str,
        validator: &str,
    ) -> ReconcileResult<StakeSubmission> {
        self.submit(OrderDraft::new(
            OrderKind::ClaimReward,
            coin_name,
            delegator,
            validator,
            DisplayAmount::ZERO,
        ))
        .await
    }

    pub async fn set_reward_address(
        &self,
        coin_name: &str,
        delegator: &str,
        reward_address: &str,
    ) -> ReconcileResult<StakeSubmission> {
        self.submit(OrderDraft::new(
            OrderKind::SetRewardAddress,
            coin_name,
            delegator,
            reward_address,
            DisplayAmount::ZERO,
        ))
        .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_validators(&self) -> ReconcileResult<Vec<ValidatorInfo>> {
        Ok(self.handler()?.get_validators().await?)
    }

    pub async fn get_validator(&self, validator: &str) -> ReconcileResult<Option<ValidatorInfo>> {
        Ok(self.handler()?.get_validator(validator).await?)
    }

    pub async fn get_validator_outstanding_rewards(
        &self,
        validator: &str,
    ) -> ReconcileResult<DisplayAmount> {
        Ok(self
            .handler()?
            .get_validator_outstanding_rewards(validator)
            .await?)
    }

    pub async fn get_delegations(&self, delegator: &str) -> ReconcileResult<Vec<DelegationInfo>> {
        Ok(self.handler()?.get_delegations(delegator).await?)
    }

    pub async fn get_unstaking_delegations(
        &self,
        delegator: &str,
    ) -> ReconcileResult<Vec<UnstakingDelegationInfo>> {
        Ok(self.handler()?.get_unstaking_delegations(delegator).await?)
    }

    pub async fn get_reward_address(&self, delegator: &str) -> ReconcileResult<String> {
        Ok(self.handler()?.get_reward_address(delegator).await?)
    }

    pub async fn get_delegation_rewards(
        &self,
        delegator: &str,
    ) -> ReconcileResult<Vec<DelegationReward>> {
        Ok(self.handler()?.get_delegation_rewards(delegator).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_chain::{ChainHandlers, SimulatedChain};
    use custody_core::{ChainIdentity, ChainKey, OrderStatus};
    use custody_registry::AddressRegistry;
    use custody_store::{LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;

    use crate::policy::ConfirmationPolicy;

    fn coordinator(with_stake: bool) -> (StakeCoordinator, Arc<MemoryStore>) {
        let sim = Arc::new(SimulatedChain::new(ChainIdentity {
            key: ChainKey::new("sim"),
            name: "Simulated".to_string(),
            index: 1,
            core_type: "sim".to_string(),
        }));
        let mut handlers = ChainHandlers::new(sim.clone());
        if with_stake {
            handlers = handlers.with_stake_handler(sim);
        }
        let store = Arc::new(MemoryStore::new());
        let reconciler = OrderReconciler::new(
            Arc::new(handlers),
            store.clone(),
            Arc::new(AddressRegistry::new()),
            ConfirmationPolicy::default(),
        );
        (StakeCoordinator::new(Arc::new(reconciler)), store)
    }

    #[tokio::test]
    async fn test_delegation_becomes_tracked_order() {
        let (stake, store) = coordinator(true);
        let submission = stake
            .submit_delegation("sim", "hot1", "valoper1", DisplayAmount::new(dec!(100)))
            .await
            .unwrap();
        assert!(matches!(submission.outcome, DispatchOutcome::Submitted(_)));

        let order = store.order(submission.order_id).unwrap();
        assert_eq!(order.kind, OrderKind::Delegate);
        assert_eq!(order.status, OrderStatus::Seen);

        let delegations = stake.get_delegations("hot1").await.unwrap();
        assert_eq!(delegations.len(), 1);
        assert_eq!(delegations[0].amount, DisplayAmount::new(dec!(100)));
    }

    #[tokio::test]
    async fn test_claim_reward_without_value() {
        let (stake, _) = coordinator(true);
        let submission = stake.claim_reward("sim", "hot1", "valoper1").await.unwrap();
        assert!(matches!(submission.outcome, DispatchOutcome::Submitted(_)));
    }

    #[tokio::test]
    async fn test_chain_without_stake_handler() {
        let (stake, store) = coordinator(false);
        let err = stake
            .submit_delegation("sim", "hot1", "valoper1", DisplayAmount::new(dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NoStakeHandler(_)));
        assert!(store.all_orders().is_empty());
        assert!(stake.get_validators().await.is_err());
    }

    #[tokio::test]
    async fn test_validator_queries() {
        let (stake, _) = coordinator(true);
        let validators = stake.get_validators().await.unwrap();
        assert_eq!(validators.len(), 2);
        assert!(stake.get_validator("valoper1").await.unwrap().is_some());
    }
}
