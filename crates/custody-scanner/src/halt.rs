//! Scan halt latch.
//!
//! Once triggered, the scanner refuses to advance until an operator resets
//! it. Triggered by reorgs deeper than the rollback window.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct ScanHalt {
    triggered: AtomicBool,
    /// Unix milliseconds, 0 if not triggered.
    triggered_at: AtomicI64,
    reason: RwLock<Option<String>>,
}

impl ScanHalt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// First trigger wins; later reasons are logged and dropped.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.triggered_at
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            *self.reason.write() = Some(reason.clone());
            error!(reason = %reason, "SCAN HALTED");
        } else {
            warn!(new_reason = %reason, "Scan already halted, ignoring new trigger");
        }
    }

    #[must_use]
    pub fn triggered_at(&self) -> Option<i64> {
        if !self.is_triggered() {
            return None;
        }
        match self.triggered_at.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Operator reset after the intervention has been resolved.
    pub fn reset(&self) {
        *self.reason.write() = None;
        self.triggered_at.store(0, Ordering::SeqCst);
        self.triggered.store(false, Ordering::SeqCst);
        info!("Scan halt reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let halt = ScanHalt::new();
        assert!(!halt.is_triggered());
        assert!(halt.triggered_at().is_none());

        halt.trigger("reorg of depth 80");
        halt.trigger("second");
        assert!(halt.is_triggered());
        assert!(halt.triggered_at().is_some());
        assert_eq!(halt.reason().as_deref(), Some("reorg of depth 80"));

        halt.reset();
        assert!(!halt.is_triggered());
        assert!(halt.reason().is_none());
    }
}
