//! Smoke tests for the OTLP pipelines.
//!
//! These expect an OTLP collector on localhost:4317:
//! ```sh
//! docker compose up -d
//! ```
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use devicio_rs::telemetry::{self, TelemetryConfig, TelemetryGuard, metrics, spans};
use opentelemetry::KeyValue;

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        telemetry::init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "devicio-smoke-test".to_string(),
            log_level: "debug".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

#[test]
#[ignore]
fn smoke_spans_carry_trace_ids() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        let trace_id = {
            let span = spans::start_delivery_span("smoke", 1, false);
            let _enter = span.enter();
            spans::record_outcome(&span, "ack");
            tracing::info!(component = "smoke-test", "inside delivery span");
            telemetry::current_trace_id()
        };

        let trace_id = trace_id.expect("expected a trace id inside an exported span");
        assert_eq!(trace_id.len(), 32);
        println!("trace id: {trace_id}");

        guard.force_flush();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });
}

#[test]
#[ignore]
fn smoke_metrics_export() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        metrics::messages_published().add(
            1,
            &[
                KeyValue::new("queue", "smoke"),
                KeyValue::new("result", "ok"),
            ],
        );
        metrics::deliveries().add(
            1,
            &[
                KeyValue::new("queue", "smoke"),
                KeyValue::new("outcome", "ack"),
            ],
        );
        metrics::operation_duration_ms().record(42.5, &[KeyValue::new("operation", "smoke")]);

        guard.force_flush();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });
}
