//! Sync span helpers.

use tracing::Span;

use crate::model::Event;

/// Start a span covering one dispatch of `event` on worker `worker`.
///
/// `sync.result` is declared empty and filled by [`record_result`].
pub fn start_sync_span(event: &Event, worker: usize) -> Span {
    tracing::info_span!(
        "reconcile.sync",
        "sync.key" = %event.key,
        "sync.action" = %event.action,
        "sync.worker" = worker,
        "sync.result" = tracing::field::Empty,
    )
}

/// Record how the sync ended ("ok", "requeued", "dropped").
pub fn record_result(span: &Span, result: &str) {
    span.record("sync.result", result);
}
