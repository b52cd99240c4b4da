//! Metrics emission for Remediation Analyst.
//!
//! Components never touch a global recorder directly. They receive an
//! `Arc<dyn MetricsSink>` at construction and emit through it, so tests can
//! assert on an [`InMemoryMetrics`] and production wiring can forward to the
//! `metrics` facade through [`RecorderMetrics`].

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Label,
};
use std::collections::HashMap;
use std::sync::{Mutex, Once, PoisonError};

/// Phase transitions, labelled by `from` and `to`.
pub const PHASE_TRANSITIONS_TOTAL: &str = "ra_phase_transitions_total";
/// Investigation backend attempts, labelled by `outcome`.
pub const INVESTIGATION_ATTEMPTS_TOTAL: &str = "ra_investigation_attempts_total";
/// Historical fallbacks, labelled by `reason`.
pub const INVESTIGATION_FALLBACKS_TOTAL: &str = "ra_investigation_fallbacks_total";
/// Final decisions, labelled by `outcome`.
pub const DECISIONS_TOTAL: &str = "ra_decisions_total";
/// Policy evaluations that failed open.
pub const POLICY_FAIL_OPEN_TOTAL: &str = "ra_policy_fail_open_total";
/// Approval outcomes, labelled by `outcome`.
pub const APPROVAL_OUTCOMES_TOTAL: &str = "ra_approval_outcomes_total";
/// Circuit breaker state (0 closed, 1 half-open, 2 open).
pub const CIRCUIT_STATE: &str = "ra_circuit_state";
/// Wall time of one reconciliation tick.
pub const RECONCILE_DURATION_SECONDS: &str = "ra_reconcile_duration_seconds";
/// Distribution of computed confidence scores.
pub const CONFIDENCE_SCORE: &str = "ra_confidence_score";

/// A label set attached to one observation.
pub type Labels<'a> = &'a [(&'static str, String)];

/// Capability for emitting metrics.
pub trait MetricsSink: Send + Sync {
    /// Increments a counter by `value`.
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64);

    /// Sets a gauge to `value`.
    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    /// Records one histogram observation.
    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Forwards observations to the process-wide `metrics` recorder.
#[derive(Debug, Clone, Default)]
pub struct RecorderMetrics;

static DESCRIBE: Once = Once::new();

impl RecorderMetrics {
    /// Creates a sink and registers metric descriptions on first use.
    pub fn new() -> Self {
        DESCRIBE.call_once(Self::register_metrics);
        Self
    }

    fn register_metrics() {
        describe_counter!(
            PHASE_TRANSITIONS_TOTAL,
            "Total number of analysis record phase transitions"
        );
        describe_counter!(
            INVESTIGATION_ATTEMPTS_TOTAL,
            "Total number of investigation backend attempts"
        );
        describe_counter!(
            INVESTIGATION_FALLBACKS_TOTAL,
            "Total number of investigations resolved from historical data"
        );
        describe_counter!(DECISIONS_TOTAL, "Total number of final decisions");
        describe_counter!(
            POLICY_FAIL_OPEN_TOTAL,
            "Total number of policy evaluations that failed open"
        );
        describe_counter!(
            APPROVAL_OUTCOMES_TOTAL,
            "Total number of resolved approval requests"
        );

        describe_gauge!(
            CIRCUIT_STATE,
            "Investigation circuit breaker state (0 closed, 1 half-open, 2 open)"
        );

        describe_histogram!(
            RECONCILE_DURATION_SECONDS,
            "Duration of a single reconciliation tick"
        );
        describe_histogram!(CONFIDENCE_SCORE, "Computed confidence scores");
    }

    fn to_labels(labels: Labels<'_>) -> Vec<Label> {
        labels
            .iter()
            .map(|(key, value)| Label::new(*key, value.clone()))
            .collect()
    }
}

impl MetricsSink for RecorderMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        counter!(name, Self::to_labels(labels)).increment(value);
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        gauge!(name, Self::to_labels(labels)).set(value);
    }

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        histogram!(name, Self::to_labels(labels)).record(value);
    }
}

/// Discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: Labels<'_>, _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
    fn record_histogram(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
}

/// Keeps observations in memory, keyed by name and sorted labels.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: Labels<'_>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let mut pairs: Vec<String> = labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        pairs.sort();
        format!("{}{{{}}}", name, pairs.join(","))
    }

    /// Returns the counter value for an exact label set.
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(&Self::key(name, labels)).copied().unwrap_or(0)
    }

    /// Returns the sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let prefix = format!("{}{{", name);
        counters
            .iter()
            .filter(|(key, _)| key.as_str() == name || key.starts_with(&prefix))
            .map(|(_, value)| *value)
            .sum()
    }

    /// Returns the latest gauge value for an exact label set.
    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.get(&Self::key(name, labels)).copied()
    }

    /// Returns every histogram observation for an exact label set.
    pub fn histogram(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        let histograms = self
            .histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        histograms
            .get(&Self::key(name, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(Self::key(name, labels)).or_insert(0) += value;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.insert(Self::key(name, labels), value);
    }

    fn record_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let mut histograms = self
            .histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        histograms
            .entry(Self::key(name, labels))
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counter_is_keyed_by_labels() {
        let sink = InMemoryMetrics::new();
        sink.increment_counter(DECISIONS_TOTAL, &[("outcome", "auto_approved".into())], 1);
        sink.increment_counter(DECISIONS_TOTAL, &[("outcome", "auto_approved".into())], 1);
        sink.increment_counter(DECISIONS_TOTAL, &[("outcome", "rejected".into())], 1);

        assert_eq!(
            sink.counter(DECISIONS_TOTAL, &[("outcome", "auto_approved".into())]),
            2
        );
        assert_eq!(sink.counter_total(DECISIONS_TOTAL), 3);
        assert_eq!(sink.counter(POLICY_FAIL_OPEN_TOTAL, &[]), 0);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let sink = InMemoryMetrics::new();
        sink.increment_counter(
            PHASE_TRANSITIONS_TOTAL,
            &[("from", "pending".into()), ("to", "validating".into())],
            1,
        );
        assert_eq!(
            sink.counter(
                PHASE_TRANSITIONS_TOTAL,
                &[("to", "validating".into()), ("from", "pending".into())]
            ),
            1
        );
    }

    #[test]
    fn test_gauge_and_histogram() {
        let sink = InMemoryMetrics::new();
        sink.set_gauge(CIRCUIT_STATE, &[], 2.0);
        sink.set_gauge(CIRCUIT_STATE, &[], 0.0);
        sink.record_histogram(CONFIDENCE_SCORE, &[], 81.5);
        sink.record_histogram(CONFIDENCE_SCORE, &[], 42.0);

        assert_eq!(sink.gauge(CIRCUIT_STATE, &[]), Some(0.0));
        assert_eq!(sink.histogram(CONFIDENCE_SCORE, &[]), vec![81.5, 42.0]);
    }

    #[test]
    fn test_recorder_without_installed_recorder_is_harmless() {
        let sink = RecorderMetrics::new();
        sink.increment_counter(DECISIONS_TOTAL, &[("outcome", "failed".into())], 1);
        sink.set_gauge(CIRCUIT_STATE, &[], 1.0);
        sink.record_histogram(RECONCILE_DURATION_SECONDS, &[], 0.01);
    }
}
