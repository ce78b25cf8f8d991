//! Handler lookup per chain and per core type.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use custody_core::{ChainIdentity, ChainKey};

use crate::adapter::{DynChainAdapter, DynStakeHandler};
use crate::error::{ChainError, ChainResult};

/// Every handler of one chain.
///
/// Some chains carry more than one asset family (e.g. native coin and token
/// standard) served by separate handlers keyed by core type.
#[derive(Clone)]
pub struct ChainHandlers {
    default: DynChainAdapter,
    by_core_type: HashMap<String, DynChainAdapter>,
    stake: Option<DynStakeHandler>,
}

impl ChainHandlers {
    pub fn new(default: DynChainAdapter) -> Self {
        Self {
            default,
            by_core_type: HashMap::new(),
            stake: None,
        }
    }

    #[must_use]
    pub fn with_handler(mut self, core_type: impl Into<String>, handler: DynChainAdapter) -> Self {
        self.by_core_type.insert(core_type.into(), handler);
        self
    }

    #[must_use]
    pub fn with_stake_handler(mut self, stake: DynStakeHandler) -> Self {
        self.stake = Some(stake);
        self
    }

    pub fn identity(&self) -> &ChainIdentity {
        self.default.identity()
    }

    pub fn has_multi_handlers(&self) -> bool {
        !self.by_core_type.is_empty()
    }

    /// Handler for `core_type`, falling back to the default handler.
    pub fn get_handler(&self, core_type: &str) -> DynChainAdapter {
        self.by_core_type
            .get(core_type)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_handler(&self) -> DynChainAdapter {
        self.default.clone()
    }

    /// Default handler first, then one entry per registered core type.
    pub fn all_handlers(&self) -> Vec<DynChainAdapter> {
        let mut keys: Vec<&String> = self.by_core_type.keys().collect();
        keys.sort();
        std::iter::once(self.default.clone())
            .chain(keys.into_iter().filter_map(|k| self.by_core_type.get(k).cloned()))
            .collect()
    }

    pub fn get_stake_handler(&self) -> Option<DynStakeHandler> {
        self.stake.clone()
    }
}

impl std::fmt::Debug for ChainHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandlers")
            .field("chain", &self.identity().key)
            .field("core_types", &self.by_core_type.keys().collect::<Vec<_>>())
            .field("stake", &self.stake.is_some())
            .finish()
    }
}

/// Chains selected at startup, keyed by chain key.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: HashMap<ChainKey, Arc<ChainHandlers>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handlers: ChainHandlers) {
        let key = handlers.identity().key.clone();
        info!(chain = %key, multi = handlers.has_multi_handlers(), "Registering chain handlers");
        self.chains.insert(key, Arc::new(handlers));
    }

    pub fn get(&self, key: &ChainKey) -> ChainResult<Arc<ChainHandlers>> {
        self.chains
            .get(key)
            .cloned()
            .ok_or_else(|| ChainError::UnknownChain(key.to_string()))
    }

    pub fn keys(&self) -> Vec<ChainKey> {
        let mut keys: Vec<_> = self.chains.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedChain;

    fn sim(key: &str, core: &str) -> Arc<SimulatedChain> {
        Arc::new(SimulatedChain::new(ChainIdentity {
            key: ChainKey::new(key),
            name: key.to_uppercase(),
            index: 60,
            core_type: core.to_string(),
        }))
    }

    #[test]
    fn test_get_handler_falls_back_to_default() {
        let native = sim("eth", "eth");
        let token = sim("eth", "erc20");
        let handlers = ChainHandlers::new(native).with_handler("erc20", token);

        assert!(handlers.has_multi_handlers());
        assert_eq!(handlers.get_handler("erc20").identity().core_type, "erc20");
        assert_eq!(handlers.get_handler("unknown").identity().core_type, "eth");
        assert!(handlers.get_stake_handler().is_none());

        let all = handlers.all_handlers();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].identity().core_type, "eth");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ChainRegistry::new();
        registry.register(ChainHandlers::new(sim("btc", "btc")));
        registry.register(ChainHandlers::new(sim("eth", "eth")));

        assert_eq!(registry.keys(), vec![ChainKey::new("btc"), ChainKey::new("eth")]);
        assert!(registry.get(&ChainKey::new("ETH")).is_ok());
        assert!(matches!(
            registry.get(&ChainKey::new("sol")),
            Err(ChainError::UnknownChain(_))
        ));
    }
}
