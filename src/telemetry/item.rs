//! Item processing span helpers.

use tracing::Span;

use crate::model::ItemState;

/// Span covering one item's claim → relocation cycle in one stage.
pub fn start_item_span(stage: &str, root: &str, item_id: &str) -> Span {
    tracing::info_span!(
        "item.process",
        "item.stage" = stage,
        "item.root" = root,
        "item.id" = item_id,
        "item.attempts" = tracing::field::Empty,
        "item.outcome" = tracing::field::Empty,
    )
}

/// Emit a state transition event scoped to `span`. A terminal state is
/// also recorded as the span's `item.outcome`.
pub fn record_transition(span: &Span, from: ItemState, to: ItemState) {
    debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
    if to.is_terminal() {
        span.record("item.outcome", tracing::field::display(to));
    }
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
}

/// Record how many callback invocations the item took.
pub fn record_attempts(span: &Span, attempts: u32) {
    span.record("item.attempts", attempts);
}
