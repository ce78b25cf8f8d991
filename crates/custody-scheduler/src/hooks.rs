//! Round hooks.
//!
//! Business code plugs in through [`RoundHooks`]. The post-round envelope
//! ([`RoundEnvelope::closer_post_hook`]) wraps `do_closer_post_hook` and is
//! not part of the trait, so the round counter and scan position can never be
//! rewritten by a hook.

use std::sync::Arc;

use tracing::warn;

use custody_chain::BoxFuture;
use custody_reconciler::SettleReport;
use custody_telemetry::Metrics;

use crate::ruler::RulerData;
use crate::runner::RoundSummary;

/// Business hooks around one closer round. Every method defaults to a no-op.
pub trait RoundHooks: Send + Sync {
    /// May rewrite the ruler data before the round starts.
    fn closer_pre_hook(&self, ruler: RulerData) -> BoxFuture<'_, anyhow::Result<RulerData>> {
        Box::pin(async move { Ok(ruler) })
    }

    /// Before sweeps and settlement of one coin.
    fn tx_and_sweep_pre_hook<'a>(
        &'a self,
        _coin_name: &'a str,
        _ruler: &'a RulerData,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// After sweeps and settlement of one coin.
    fn tx_and_sweep_post_hook<'a>(
        &'a self,
        _coin_name: &'a str,
        _report: &'a SettleReport,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Business post-round step; may rewrite the ruler's business data.
    fn do_closer_post_hook<'a>(
        &'a self,
        ruler: RulerData,
        _summary: &'a RoundSummary,
    ) -> BoxFuture<'a, anyhow::Result<RulerData>> {
        Box::pin(async move { Ok(ruler) })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRoundHooks;

impl RoundHooks for NoopRoundHooks {}

/// Hook invocation with failure isolation and envelope invariants.
#[derive(Clone)]
pub struct RoundEnvelope {
    chain: String,
    hooks: Arc<dyn RoundHooks>,
}

impl std::fmt::Debug for RoundEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundEnvelope")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl RoundEnvelope {
    pub fn new(chain: impl Into<String>, hooks: Arc<dyn RoundHooks>) -> Self {
        Self {
            chain: chain.into(),
            hooks,
        }
    }

    fn failed(&self, hook: &str, err: &anyhow::Error) {
        warn!(chain = %self.chain, hook, error = %err, "Round hook failed");
        Metrics::hook_failure(&self.chain, hook);
    }

    /// Envelope fields written by the pre hook are restored.
    pub async fn closer_pre_hook(&self, ruler: RulerData) -> RulerData {
        let before = ruler.clone();
        match self.hooks.closer_pre_hook(ruler).await {
            Ok(rewritten) => self.enforce("closer_pre_hook", &before, rewritten),
            Err(e) => {
                self.failed("closer_pre_hook", &e);
                before
            }
        }
    }

    pub async fn tx_and_sweep_pre_hook(&self, coin_name: &str, ruler: &RulerData) {
        if let Err(e) = self.hooks.tx_and_sweep_pre_hook(coin_name, ruler).await {
            self.failed("tx_and_sweep_pre_hook", &e);
        }
    }

    pub async fn tx_and_sweep_post_hook(&self, coin_name: &str, report: &SettleReport) {
        if let Err(e) = self.hooks.tx_and_sweep_post_hook(coin_name, report).await {
            self.failed("tx_and_sweep_post_hook", &e);
        }
    }

    /// Run the business post hook, then re-assert the envelope fields.
    pub async fn closer_post_hook(&self, ruler: RulerData, summary: &RoundSummary) -> RulerData {
        let before = ruler.clone();
        match self.hooks.do_closer_post_hook(ruler, summary).await {
            Ok(rewritten) => self.enforce("do_closer_post_hook", &before, rewritten),
            Err(e) => {
                self.failed("do_closer_post_hook", &e);
                before
            }
        }
    }

    fn enforce(&self, hook: &str, before: &RulerData, mut after: RulerData) -> RulerData {
        if after.version != before.version
            || after.task_round != before.task_round
            || after.last_scanned != before.last_scanned
            || after.last_round_at != before.last_round_at
        {
            warn!(
                chain = %self.chain,
                hook,
                task_round = before.task_round,
                "Hook rewrote envelope fields, restoring"
            );
            Metrics::hook_failure(&self.chain, hook);
            after.version = before.version;
            after.task_round = before.task_round;
            after.last_scanned = before.last_scanned;
            after.last_round_at = before.last_round_at;
        }
        after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Meddling;

    impl RoundHooks for Meddling {
        fn do_closer_post_hook<'a>(
            &'a self,
            mut ruler: RulerData,
            _summary: &'a RoundSummary,
        ) -> BoxFuture<'a, anyhow::Result<RulerData>> {
            Box::pin(async move {
                ruler.task_round = 999;
                ruler.data.insert("note".to_string(), serde_json::json!("kept"));
                Ok(ruler)
            })
        }
    }

    struct Failing;

    impl RoundHooks for Failing {
        fn closer_pre_hook(&self, _ruler: RulerData) -> BoxFuture<'_, anyhow::Result<RulerData>> {
            Box::pin(async { Err(anyhow::anyhow!("boom")) })
        }
    }

    #[tokio::test]
    async fn test_envelope_restores_round_counter() {
        let envelope = RoundEnvelope::new("sim", Arc::new(Meddling));
        let ruler = RulerData {
            task_round: 4,
            ..RulerData::default()
        };
        let after = envelope
            .closer_post_hook(ruler, &RoundSummary::new(4))
            .await;
        assert_eq!(after.task_round, 4);
        assert_eq!(after.data.get("note"), Some(&serde_json::json!("kept")));
    }

    #[tokio::test]
    async fn test_failing_pre_hook_keeps_ruler() {
        let envelope = RoundEnvelope::new("sim", Arc::new(Failing));
        let ruler = RulerData {
            task_round: 2,
            ..RulerData::default()
        };
        assert_eq!(envelope.closer_pre_hook(ruler.clone()).await, ruler);
    }
}
