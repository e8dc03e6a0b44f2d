//! Metric instrument factories for logaudit.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the [`SERVICE_NAME`] meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

use super::SERVICE_NAME;

/// Returns the shared meter for logaudit instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(SERVICE_NAME)
}

/// Counter: tasks offered to the store for insertion.
/// Labels: `result` ("inserted" | "duplicate").
pub fn tasks_inserted() -> Counter<u64> {
    meter()
        .u64_counter("logaudit.tasks.inserted")
        .with_description("Number of tasks offered for insertion")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("logaudit.task.transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: batch mutations that touched fewer rows than requested.
/// Labels: `operation`.
pub fn batch_mismatches() -> Counter<u64> {
    meter()
        .u64_counter("logaudit.batch.mismatches")
        .with_description("Batch mutations affecting fewer rows than requested")
        .build()
}

/// Histogram: batch operation duration in milliseconds.
/// Labels: `operation`.
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("logaudit.batch.duration_ms")
        .with_description("Batch operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
