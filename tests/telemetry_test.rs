//! Integration tests for telemetry initialization and span helpers.

use opentelemetry::KeyValue;
use stagepipe::model::ItemState;
use stagepipe::telemetry::item::{record_attempts, record_transition, start_item_span};
use stagepipe::telemetry::{TelemetryConfig, init_telemetry, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process; a
    // second init in the same binary may return Err, which is fine here.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "stagepipe-test".to_string(),
        default_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn item_span_records_lifecycle() {
    let span = start_item_span("categorize", "main", "1042");
    record_transition(&span, ItemState::Queued, ItemState::Claimed);
    record_attempts(&span, 3);
    record_transition(&span, ItemState::Claimed, ItemState::Rejected);

    let span = start_item_span("categorize", "pri", "1043");
    record_transition(&span, ItemState::Queued, ItemState::Claimed);
    record_transition(&span, ItemState::Claimed, ItemState::Advanced);
}

#[test]
fn metric_instruments_work_without_exporter() {
    let labels = [
        KeyValue::new("stage", "categorize"),
        KeyValue::new("root", "main"),
    ];
    metrics::items_claimed().add(1, &labels);
    metrics::items_advanced().add(1, &labels);
    metrics::items_rejected().add(1, &labels);
    metrics::stage_attempts().add(1, &[KeyValue::new("result", "reject")]);
    metrics::slot_acquisitions().add(1, &[KeyValue::new("result", "acquired")]);
    metrics::slot_wait_ms().record(12.5, &[KeyValue::new("result", "acquired")]);
}
