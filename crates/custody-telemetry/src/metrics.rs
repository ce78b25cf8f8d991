//! Prometheus metrics for the custody engine.
//!
//! Every metric carries a `chain` label.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a startup bug; it can only happen during
//! static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Last fully processed block.
pub static SCAN_HEIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "custody_scan_height",
        "Last fully processed block",
        &["chain"]
    )
    .unwrap()
});

/// Chain tip as reported by the adapter.
pub static CHAIN_TIP: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("custody_chain_tip", "Chain tip reported by the node", &["chain"])
        .unwrap()
});

pub static BLOCKS_SCANNED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_blocks_scanned_total",
        "Blocks fully classified and folded",
        &["chain"]
    )
    .unwrap()
});

/// Labels: class (normal/unexpected/internal/special)
pub static RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_records_total",
        "Incoming records classified",
        &["chain", "class"]
    )
    .unwrap()
});

/// Labels: reason (invalid_address/validation_error/foreign/duplicate)
pub static RECORDS_DISCARDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_records_discarded_total",
        "Incoming records discarded during classification",
        &["chain", "reason"]
    )
    .unwrap()
});

pub static ORDER_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_order_transitions_total",
        "Order status transitions",
        &["chain", "kind", "to"]
    )
    .unwrap()
});

/// Labels: outcome (submitted/unreachable/timeout/rejected/fee_insufficient)
pub static BROADCASTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_broadcasts_total",
        "Broadcast attempts",
        &["chain", "kind", "outcome"]
    )
    .unwrap()
});

pub static ROLLBACKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_rollbacks_total",
        "Reorg rollbacks applied",
        &["chain"]
    )
    .unwrap()
});

pub static REORG_DEPTH: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "custody_reorg_depth_blocks",
        "Depth of detected reorganizations",
        &["chain"],
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    )
    .unwrap()
});

pub static INTERVENTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_interventions_total",
        "Manual-intervention records raised",
        &["chain", "reason"]
    )
    .unwrap()
});

pub static HOOK_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_hook_failures_total",
        "Hook errors isolated from order state",
        &["chain", "hook"]
    )
    .unwrap()
});

pub static SCAN_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "custody_scan_errors_total",
        "Scan attempts aborted by adapter errors",
        &["chain", "transient"]
    )
    .unwrap()
});

pub static DEFERRED_PLANS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "custody_deferred_plans",
        "Orders waiting on an await plan",
        &["chain"]
    )
    .unwrap()
});

pub static ROUND_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "custody_round_duration_ms",
        "Closer round duration in milliseconds",
        &["chain"],
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    pub fn scan_height(chain: &str, bn: u64) {
        SCAN_HEIGHT.with_label_values(&[chain]).set(bn as i64);
    }

    pub fn chain_tip(chain: &str, bn: u64) {
        CHAIN_TIP.with_label_values(&[chain]).set(bn as i64);
    }

    pub fn block_scanned(chain: &str) {
        BLOCKS_SCANNED_TOTAL.with_label_values(&[chain]).inc();
    }

    pub fn record_classified(chain: &str, class: &str) {
        RECORDS_TOTAL.with_label_values(&[chain, class]).inc();
    }

    pub fn record_discarded(chain: &str, reason: &str) {
        RECORDS_DISCARDED_TOTAL
            .with_label_values(&[chain, reason])
            .inc();
    }

    pub fn order_transition(chain: &str, kind: &str, to: &str) {
        ORDER_TRANSITIONS_TOTAL
            .with_label_values(&[chain, kind, to])
            .inc();
    }

    pub fn broadcast(chain: &str, kind: &str, outcome: &str) {
        BROADCASTS_TOTAL
            .with_label_values(&[chain, kind, outcome])
            .inc();
    }

    pub fn rollback(chain: &str, depth: u64) {
        ROLLBACKS_TOTAL.with_label_values(&[chain]).inc();
        REORG_DEPTH.with_label_values(&[chain]).observe(depth as f64);
    }

    pub fn intervention(chain: &str, reason: &str) {
        INTERVENTIONS_TOTAL.with_label_values(&[chain, reason]).inc();
    }

    pub fn hook_failure(chain: &str, hook: &str) {
        HOOK_FAILURES_TOTAL.with_label_values(&[chain, hook]).inc();
    }

    pub fn scan_error(chain: &str, transient: bool) {
        let transient = if transient { "true" } else { "false" };
        SCAN_ERRORS_TOTAL
            .with_label_values(&[chain, transient])
            .inc();
    }

    pub fn deferred_plans(chain: &str, count: usize) {
        DEFERRED_PLANS.with_label_values(&[chain]).set(count as i64);
    }

    pub fn round_duration(chain: &str, duration_ms: f64) {
        ROUND_DURATION_MS
            .with_label_values(&[chain])
            .observe(duration_ms);
    }

    /// Render every registered metric in the text exposition format.
    pub fn gather() -> TelemetryResult<String> {
        let families = prometheus::gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_gather() {
        Metrics::block_scanned("test_chain");
        Metrics::record_classified("test_chain", "normal");
        Metrics::scan_height("test_chain", 42);
        Metrics::rollback("test_chain", 3);

        let text = Metrics::gather().unwrap();
        assert!(text.contains("custody_blocks_scanned_total"));
        assert!(text.contains("custody_scan_height{chain=\"test_chain\"} 42"));
        assert!(text.contains("custody_reorg_depth_blocks"));
    }
}
