// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus metrics for the worker, served on `/metrics`.

use std::sync::Arc;

use forklift_core::sandbox::EventListener;
use forklift_core::EventType;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref SANDBOX_EVENTS: IntCounterVec = register_int_counter_vec!(
        "forklift_sandbox_events_total",
        "Sandbox lifecycle events by kind",
        &["event"]
    )
    .unwrap();
    pub static ref LIVE_SANDBOXES: IntGauge = register_int_gauge!(
        "forklift_live_sandboxes",
        "Sandboxes created and not yet destroyed"
    )
    .unwrap();
    pub static ref INVOCATIONS: IntCounterVec = register_int_counter_vec!(
        "forklift_invocations_total",
        "Function invocations by response status",
        &["function", "status"]
    )
    .unwrap();
    pub static ref INVOCATION_DURATION: HistogramVec = register_histogram_vec!(
        "forklift_invocation_duration_seconds",
        "Time from admission to response",
        &["function"],
        vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]
    )
    .unwrap();
}

/// Force registration so every metric shows up before its first sample.
pub fn init() {
    lazy_static::initialize(&SANDBOX_EVENTS);
    lazy_static::initialize(&LIVE_SANDBOXES);
    lazy_static::initialize(&INVOCATIONS);
    lazy_static::initialize(&INVOCATION_DURATION);
}

/// Sandbox listener feeding the sandbox metrics.
pub fn sandbox_listener() -> EventListener {
    Arc::new(|event, _sb| {
        SANDBOX_EVENTS.with_label_values(&[event.name()]).inc();
        match event {
            EventType::Create => LIVE_SANDBOXES.inc(),
            EventType::Destroy => LIVE_SANDBOXES.dec(),
            _ => {}
        }
    })
}

pub fn record_invocation(function: &str, status: u16, seconds: f64) {
    INVOCATIONS
        .with_label_values(&[function, &status.to_string()])
        .inc();
    INVOCATION_DURATION
        .with_label_values(&[function])
        .observe(seconds);
}

/// Everything registered, in the Prometheus text format.
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}
