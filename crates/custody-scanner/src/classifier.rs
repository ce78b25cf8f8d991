//! Record classification against the address registry.
//!
//! | from   | to                          | result                 |
//! |--------|-----------------------------|------------------------|
//! | system | system                      | internal               |
//! | system | foreign                     | kept, matched later    |
//! | system | invalid                     | kept, matched later    |
//! | foreign| deposit (active)            | normal deposit         |
//! | foreign| deposit (frozen / retired)  | unexpected             |
//! | foreign| hot / cold                  | unexpected             |
//! | foreign| foreign                     | discarded              |
//!
//! Destinations are validated only for inbound records; whatever leaves a
//! system address is kept so an unmatched outflow still raises an
//! intervention. Adapter-set flags are never cleared.

use std::sync::Arc;

use tracing::debug;

use custody_chain::DynChainAdapter;
use custody_core::{AddressRole, AddressState, ChainKey, IncomingRecord, ValidationOutcome};
use custody_registry::AddressRegistry;
use custody_telemetry::Metrics;

/// Why a record was dropped before reaching the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    Foreign,
    InvalidAddress,
    ValidationError(u32),
    ZeroValue,
}

impl Discard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreign => "foreign",
            Self::InvalidAddress => "invalid_address",
            Self::ValidationError(_) => "validation_error",
            Self::ZeroValue => "zero_value",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    chain: ChainKey,
    registry: Arc<AddressRegistry>,
}

impl Classifier {
    pub fn new(chain: ChainKey, registry: Arc<AddressRegistry>) -> Self {
        Self { chain, registry }
    }

    /// Tag one record, or say why it is dropped.
    pub async fn classify(
        &self,
        adapter: &DynChainAdapter,
        mut record: IncomingRecord,
    ) -> Result<IncomingRecord, Discard> {
        let coin = record.coin_name.as_str();
        let from = self.registry.get(coin, &record.from_address);
        let to = self.registry.get(coin, &record.to_address);

        if from.is_none() && to.is_none() {
            return Err(Discard::Foreign);
        }
        if !record.value.is_positive() && record.action.is_none() {
            return Err(Discard::ZeroValue);
        }
        if from.is_none() {
            match adapter.validate_address(&record.to_address, coin).await {
                ValidationOutcome::Valid => {}
                ValidationOutcome::Invalid => return Err(Discard::InvalidAddress),
                ValidationOutcome::Error(code) => return Err(Discard::ValidationError(code)),
            }
        }

        match (&from, &to) {
            (Some(_), Some(_)) => record.is_internal = true,
            (None, Some(dest)) => {
                let unexpected = match dest.address.role {
                    AddressRole::Deposit => dest.address.state != AddressState::Active,
                    AddressRole::Hot | AddressRole::Cold => true,
                };
                record.is_unexpected |= unexpected;
            }
            _ => {}
        }
        Ok(record)
    }

    /// Classify a batch, dropping discarded records with a metric.
    pub async fn classify_all(
        &self,
        adapter: &DynChainAdapter,
        records: Vec<IncomingRecord>,
    ) -> Vec<IncomingRecord> {
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            let key = record.key();
            match self.classify(adapter, record).await {
                Ok(record) => {
                    Metrics::record_classified(self.chain.as_str(), &record.class().to_string());
                    kept.push(record);
                }
                Err(reason) => {
                    debug!(chain = %self.chain, record = %key, reason = ?reason, "Record discarded");
                    Metrics::record_discarded(self.chain.as_str(), reason.as_str());
                }
            }
        }
        kept
    }
}
