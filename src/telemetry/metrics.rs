//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`, so
//! every instrument is a no-op until telemetry is initialized with an endpoint.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("redis-message-queue")
}

/// Counter: publish attempts.
/// Labels: `queue`, `result` ("ok" | "duplicate").
pub fn messages_published() -> Counter<u64> {
    meter()
        .u64_counter("rmq.messages.published")
        .with_description("Number of publish attempts")
        .build()
}

/// Counter: leases closed.
/// Labels: `queue`, `outcome` ("completed" | "failed").
pub fn messages_processed() -> Counter<u64> {
    meter()
        .u64_counter("rmq.messages.processed")
        .with_description("Number of leased messages routed out of processing")
        .build()
}

/// Counter: successful gateway operations.
/// Labels: `operation`.
pub fn gateway_operations() -> Counter<u64> {
    meter()
        .u64_counter("rmq.gateway.operations")
        .with_description("Number of store operations")
        .build()
}

/// Counter: retries of failed store operations.
/// Labels: `operation`.
pub fn store_retries() -> Counter<u64> {
    meter()
        .u64_counter("rmq.gateway.retries")
        .with_description("Number of retried store operations")
        .build()
}

/// Histogram: handler run time in milliseconds.
/// Labels: `queue`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("rmq.handler.duration_ms")
        .with_description("Message handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub fn record_publish(queue: &str, accepted: bool) {
    messages_published().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("result", if accepted { "ok" } else { "duplicate" }),
        ],
    );
}

pub fn record_handler_duration(queue: &str, elapsed: Duration) {
    handler_duration_ms().record(
        elapsed.as_secs_f64() * 1000.0,
        &[KeyValue::new("queue", queue.to_string())],
    );
}
