//! Metric instrument factories.
//!
//! Instruments come from the `"stagepipe"` meter on the global
//! `MeterProvider`; without an OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("stagepipe")
}

/// Counter: items renamed into a stage's `tmp/`.
/// Labels: `stage`, `root`.
pub fn items_claimed() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.items.claimed")
        .with_description("Items claimed for processing")
        .build()
}

/// Counter: items relocated to the next stage.
/// Labels: `stage`, `root`.
pub fn items_advanced() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.items.advanced")
        .with_description("Items relocated to the next stage")
        .build()
}

/// Counter: items relocated to a reject directory.
/// Labels: `stage`, `root`.
pub fn items_rejected() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.items.rejected")
        .with_description("Items relocated to a reject directory")
        .build()
}

/// Counter: items that could not be claimed or relocated.
/// Labels: `stage`, `phase` ("claim" | "relocate").
pub fn item_failures() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.items.failures")
        .with_description("Items left in place after a claim or relocation error")
        .build()
}

/// Counter: stage callback invocations.
/// Labels: `stage`, `result` ("advance" | "reject" | "error").
pub fn stage_attempts() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.stage.attempts")
        .with_description("Stage callback invocations")
        .build()
}

/// Counter: endpoint slot acquisitions.
/// Labels: `result` ("acquired" | "exhausted" | "no_capable_endpoint" | "cancelled").
pub fn slot_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.pool.acquisitions")
        .with_description("Endpoint slot acquisition outcomes")
        .build()
}

/// Counter: slot files removed because their owner was gone.
pub fn stale_locks_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.pool.stale_reclaimed")
        .with_description("Stale slot files reclaimed")
        .build()
}

/// Histogram: time from acquisition request to outcome.
/// Labels: `result`.
pub fn slot_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("stagepipe.pool.wait_ms")
        .with_description("Time spent waiting for an endpoint slot")
        .with_unit("ms")
        .build()
}
