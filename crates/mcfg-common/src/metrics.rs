//! OpenTelemetry metrics for the machine config controllers
//!
//! - Render controller: paused pools holding important changes, OS image
//!   overrides, reconcile latency and errors
//! - Daemon: drain failures

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("mcfg"));

// ============================================================================
// Render Controller Metrics
// ============================================================================

/// 1 while a paused pool has a certificate rotation waiting to roll out
///
/// Labels:
/// - `pool`: pool name
pub static IMPORTANT_CONFIG_PAUSED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("mcc_important_config_paused")
        .with_description("Paused pool has an important config change pending")
        .with_unit("{pools}")
        .build()
});

/// 1 while the pool's rendered config pins a non-default OS image
///
/// Labels:
/// - `pool`: pool name
pub static OS_IMAGE_URL_OVERRIDE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("mcc_os_image_url_override")
        .with_description("Rendered config overrides the release OS image")
        .with_unit("{pools}")
        .build()
});

/// Histogram of pool reconcile duration
///
/// Labels:
/// - `pool`: pool name
/// - `result`: success, deferred, error
pub static POOL_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("mcc_pool_reconcile_duration_seconds")
        .with_description("Duration of pool render reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of pool reconcile errors
///
/// Labels:
/// - `pool`: pool name
pub static POOL_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mcc_pool_reconcile_errors_total")
        .with_description("Total number of pool render errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Daemon Metrics
// ============================================================================

/// 1 while the last drain of this node failed
///
/// Labels:
/// - `node`: node name
pub static DRAIN_ERR: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("mcd_drain_err")
        .with_description("Errors from the last failed drain")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Recording Helpers
// ============================================================================

fn flag(value: bool) -> i64 {
    i64::from(value)
}

/// Record whether `pool` is paused with an important change pending
pub fn set_important_config_paused(pool: &str, paused: bool) {
    IMPORTANT_CONFIG_PAUSED.record(flag(paused), &[KeyValue::new("pool", pool.to_string())]);
}

/// Record whether `pool` renders a non-default OS image
pub fn set_os_image_url_override(pool: &str, overridden: bool) {
    OS_IMAGE_URL_OVERRIDE.record(flag(overridden), &[KeyValue::new("pool", pool.to_string())]);
}

/// Record whether the last drain of `node` failed
pub fn set_drain_err(node: &str, failed: bool) {
    DRAIN_ERR.record(flag(failed), &[KeyValue::new("node", node.to_string())]);
}

/// Outcome label of a pool reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Pool is rendered and adopted
    Success,
    /// Render was postponed until the operator finishes
    Deferred,
    /// Render failed
    Error,
}

impl ReconcileOutcome {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Deferred => "deferred",
            Self::Error => "error",
        }
    }
}

/// Times one pool reconcile
pub struct ReconcileTimer {
    pool: String,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile of `pool`
    pub fn start(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            start: Instant::now(),
        }
    }

    /// Record the elapsed time with the given outcome
    pub fn finish(self, outcome: ReconcileOutcome) {
        let elapsed = self.start.elapsed().as_secs_f64();
        POOL_RECONCILE_DURATION.record(
            elapsed,
            &[
                KeyValue::new("pool", self.pool.clone()),
                KeyValue::new("result", outcome.as_str()),
            ],
        );
        if outcome == ReconcileOutcome::Error {
            POOL_RECONCILE_ERRORS.add(1, &[KeyValue::new("pool", self.pool)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(ReconcileOutcome::Success.as_str(), "success");
        assert_eq!(ReconcileOutcome::Deferred.as_str(), "deferred");
        assert_eq!(ReconcileOutcome::Error.as_str(), "error");
    }

    #[test]
    fn recording_without_provider_is_a_noop() {
        set_important_config_paused("worker", true);
        set_os_image_url_override("worker", false);
        set_drain_err("node-a", true);
        ReconcileTimer::start("worker").finish(ReconcileOutcome::Error);
    }
}
