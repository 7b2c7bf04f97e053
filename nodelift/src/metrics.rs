//! Native in-process metrics.
//!
//! The core does not expose a scrape endpoint; callers map the registry onto
//! whatever backend they run. Metrics are keyed by name plus a sorted label
//! set so lookups in tests are exact.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;

pub const SCHEDULING_DURATION_SECONDS: &str = "scheduling_duration_seconds";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const UNSCHEDULABLE_PODS_COUNT: &str = "unschedulable_pods_count";
pub const ELIGIBLE_NODES: &str = "eligible_nodes";
pub const DECISIONS_TOTAL: &str = "decisions_total";
pub const CONSOLIDATION_TIMEOUTS_TOTAL: &str = "consolidation_timeouts_total";
pub const NODEPOOL_ALLOWED_DISRUPTIONS: &str = "nodepool_allowed_disruptions";
pub const QUEUE_FAILURES_TOTAL: &str = "queue_failures_total";
pub const NODECLAIMS_DISRUPTED_TOTAL: &str = "nodeclaims_disrupted_total";

lazy_static! {
    static ref REGISTRY: Registry = Registry::default();
}

#[derive(Default)]
struct Registry {
    counters: Mutex<HashMap<MetricKey, u64>>,
    gauges: Mutex<HashMap<MetricKey, f64>>,
    observations: Mutex<HashMap<MetricKey, (u64, f64)>>,
}

type MetricKey = (String, Vec<(String, String)>);

fn key(name: &str, labels: &[(&str, &str)]) -> MetricKey {
    let mut labels: Vec<(String, String)> =
        labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    labels.sort();
    (name.to_string(), labels)
}

/// Add `value` to a counter
pub fn counter_add(name: &str, labels: &[(&str, &str)], value: u64) {
    *REGISTRY.counters.lock().entry(key(name, labels)).or_insert(0) += value;
}

pub fn counter_inc(name: &str, labels: &[(&str, &str)]) {
    counter_add(name, labels, 1);
}

pub fn counter_value(name: &str, labels: &[(&str, &str)]) -> u64 {
    REGISTRY.counters.lock().get(&key(name, labels)).copied().unwrap_or(0)
}

/// Set a gauge
pub fn gauge_set(name: &str, labels: &[(&str, &str)], value: f64) {
    REGISTRY.gauges.lock().insert(key(name, labels), value);
}

pub fn gauge_value(name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    REGISTRY.gauges.lock().get(&key(name, labels)).copied()
}

/// Record one observation of a duration-style metric
pub fn observe(name: &str, labels: &[(&str, &str)], value: f64) {
    let mut observations = REGISTRY.observations.lock();
    let entry = observations.entry(key(name, labels)).or_insert((0, 0.0));
    entry.0 += 1;
    entry.1 += value;
}

pub fn observation_count(name: &str, labels: &[(&str, &str)]) -> u64 {
    REGISTRY.observations.lock().get(&key(name, labels)).map(|(count, _)| *count).unwrap_or(0)
}
