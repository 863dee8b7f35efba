//! Metric instrument factories for devicio-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"devicio-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for devicio-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("devicio-rs")
}

/// Counter: messages published to the broker.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn messages_published() -> Counter<u64> {
    meter()
        .u64_counter("devicio.queue.published")
        .with_description("Number of messages published")
        .build()
}

/// Counter: deliveries settled by the consumer.
/// Labels: `queue`, `outcome` ("ack" | "nack_requeue" | "nack_drop").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("devicio.queue.deliveries")
        .with_description("Number of deliveries settled by the consumer")
        .build()
}

/// Counter: calls to the unstable dependency.
/// Labels: `outcome` ("ok" | "unstable" | "unknown" | "cancelled").
pub fn unstable_calls() -> Counter<u64> {
    meter()
        .u64_counter("devicio.unstable.calls")
        .with_description("Calls to the unstable downstream dependency")
        .build()
}

/// Counter: routine writes to the record store.
/// Labels: `result` ("ok" | "error").
pub fn store_writes() -> Counter<u64> {
    meter()
        .u64_counter("devicio.store.writes")
        .with_description("Routine records written to the store")
        .build()
}

/// Counter: worker pool job results.
/// Labels: `result` ("ok" | "error").
pub fn pool_jobs() -> Counter<u64> {
    meter()
        .u64_counter("devicio.pool.jobs")
        .with_description("Jobs completed by the worker pool")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("devicio.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
