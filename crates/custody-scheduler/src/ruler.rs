//! Ruler data: the only memory carried from one round to the next besides
//! the ledger store itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use custody_core::BlockNumber;
use custody_store::LedgerStore;

use crate::error::{SchedulerError, SchedulerResult};

/// Current ruler data layout.
pub const RULER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulerData {
    pub version: u32,
    /// Strictly increasing, advanced only by the round envelope.
    pub task_round: u64,
    #[serde(default)]
    pub last_scanned: Option<BlockNumber>,
    /// Unix milliseconds at the end of the last round.
    #[serde(default)]
    pub last_round_at: Option<i64>,
    /// Free-form business state owned by the round hooks.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Default for RulerData {
    fn default() -> Self {
        Self {
            version: RULER_VERSION,
            task_round: 0,
            last_scanned: None,
            last_round_at: None,
            data: BTreeMap::new(),
        }
    }
}

impl RulerData {
    /// Restore from the store; absent data starts at round 0.
    pub fn load(store: &dyn LedgerStore) -> SchedulerResult<Self> {
        let Some(raw) = store.ruler_data() else {
            return Ok(Self::default());
        };
        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        if version > RULER_VERSION {
            return Err(SchedulerError::RulerVersion {
                found: version,
                supported: RULER_VERSION,
            });
        }
        if version < RULER_VERSION {
            warn!(found = version, current = RULER_VERSION, "Upgrading ruler data");
        }
        let mut ruler: Self = serde_json::from_value(raw)?;
        ruler.version = RULER_VERSION;
        Ok(ruler)
    }

    pub fn save(&self, store: &dyn LedgerStore) -> SchedulerResult<()> {
        store.set_ruler_data(serde_json::to_value(self)?);
        Ok(())
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> SchedulerResult<()> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }
}
