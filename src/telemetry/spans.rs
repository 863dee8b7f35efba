//! Span helpers for deliveries and pool jobs.

use tracing::Span;

/// Start a span for one broker delivery.
///
/// The `delivery.outcome` field is declared empty and filled by
/// [`record_outcome`] once the delivery is settled.
pub fn start_delivery_span(queue: &str, delivery_tag: u64, redelivered: bool) -> Span {
    tracing::info_span!(
        "queue.delivery",
        "messaging.destination.name" = queue,
        "messaging.delivery_tag" = delivery_tag,
        "messaging.redelivered" = redelivered,
        "delivery.outcome" = tracing::field::Empty,
    )
}

/// Start a span for one worker pool job.
pub fn start_job_span(worker_id: usize, job: u64) -> Span {
    tracing::info_span!("pool.job", "pool.worker_id" = worker_id, "pool.job" = job)
}

/// Record how a delivery was settled on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("delivery.outcome", outcome);
}
