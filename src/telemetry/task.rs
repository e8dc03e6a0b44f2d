//! Batch span helpers.
//!
//! Every store batch runs inside a `task.batch` span carrying the operation
//! name, the number of ids requested, and (once committed) the rows affected.

use tracing::Span;

/// Start a span for one batch operation.
///
/// The `batch.affected` field is declared empty and filled by
/// [`record_batch_result`].
pub fn start_batch_span(operation: &'static str, size: usize) -> Span {
    tracing::info_span!(
        "task.batch",
        "batch.operation" = operation,
        "batch.size" = size,
        "batch.affected" = tracing::field::Empty,
    )
}

/// Record how many rows the committed batch changed.
pub fn record_batch_result(span: &Span, affected: u64) {
    span.record("batch.affected", affected);
}
