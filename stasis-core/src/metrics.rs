// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus metrics for operations, jobs and the GPU pool.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

use crate::state::ControllerState;

lazy_static! {
    pub static ref OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "stasis_operations_total",
        "Operations handled, by kind and outcome",
        &["operation", "outcome"]
    )
    .unwrap();
    pub static ref OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "stasis_operation_duration_seconds",
        "Wall time of an operation",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .unwrap();
    pub static ref MANAGED_JOBS: IntGauge = register_int_gauge!(
        "stasis_managed_jobs",
        "Jobs whose process is currently tracked"
    )
    .unwrap();
    pub static ref DURABILITY_RETRIES: IntCounter = register_int_counter!(
        "stasis_durability_retries_total",
        "Durability actions re-queued after a store failure"
    )
    .unwrap();
    pub static ref GPU_CONTROLLERS: IntGaugeVec = register_int_gauge_vec!(
        "stasis_gpu_controllers",
        "GPU controllers known to the pool, by state",
        &["state"]
    )
    .unwrap();
}

/// Record one finished operation.
pub fn observe(operation: &str, elapsed_secs: f64, ok: bool) {
    OPERATIONS
        .with_label_values(&[operation, if ok { "ok" } else { "error" }])
        .inc();
    OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(elapsed_secs);
}

pub fn set_gpu_controllers(states: &[ControllerState]) {
    for state in [
        ControllerState::Free,
        ControllerState::Busy,
        ControllerState::Stale,
    ] {
        let count = states.iter().filter(|s| **s == state).count();
        GPU_CONTROLLERS
            .with_label_values(&[state.name()])
            .set(count as i64);
    }
}

/// Text exposition of every registered metric.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_shows_in_gather() {
        observe("dump", 0.2, true);
        set_gpu_controllers(&[ControllerState::Free, ControllerState::Busy]);
        let text = gather();
        assert!(text.contains("stasis_operations_total"));
        assert!(text.contains("stasis_gpu_controllers"));
    }
}
