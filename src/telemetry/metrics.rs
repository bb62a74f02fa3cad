//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("reconciler")
}

/// Counter: completed sync attempts.
/// Labels: `action`, `result` ("ok" | "requeued" | "dropped").
pub fn sync_total() -> Counter<u64> {
    meter()
        .u64_counter("reconciler.sync.total")
        .with_description("Number of completed sync attempts")
        .build()
}

/// Histogram: time spent in a single sync, handler included.
/// Labels: `action`.
pub fn sync_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("reconciler.sync.duration_ms")
        .with_description("Sync duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: rate-limited requeues after a failed sync.
pub fn queue_requeues() -> Counter<u64> {
    meter()
        .u64_counter("reconciler.queue.requeues")
        .with_description("Number of keys requeued with backoff")
        .build()
}

/// Counter: keys dropped after exhausting their retries.
pub fn queue_dropped() -> Counter<u64> {
    meter()
        .u64_counter("reconciler.queue.dropped")
        .with_description("Number of keys dropped after too many failures")
        .build()
}

/// Counter: errors handed to the error reporter.
/// Labels: `kind`.
pub fn errors_reported() -> Counter<u64> {
    meter()
        .u64_counter("reconciler.errors.reported")
        .with_description("Number of errors reported out of band")
        .build()
}
