//! Tracing integration for structured logging and spans.

use crate::error::Error;
use crate::id::{BufferId, ProcessId};
use tracing::{Level, Span, span};

/// Create a span for an operation on one surface.
///
/// # Example
///
/// ```rust,ignore
/// use surfacekit::observability::span_surface;
///
/// let span = span_surface("free", surface.id());
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_surface(op: &'static str, id: BufferId) -> Span {
    span!(Level::DEBUG, "surface", op = op, id = %id)
}

/// Create a span for a registry operation.
#[inline]
pub fn span_registry(op: &'static str, registry: &str) -> Span {
    span!(Level::TRACE, "registry", op = op, registry = %registry)
}

/// Enter a surface span and return the guard.
pub fn instrument_surface(op: &'static str, id: BufferId) -> tracing::span::EnteredSpan {
    span_surface(op, id).entered()
}

/// Log a refused owner free.
#[inline]
pub fn trace_free_in_use(id: BufferId, pid: ProcessId, global_use: u32) {
    tracing::error!(
        id = %id,
        pid = %pid,
        global_use = global_use,
        "cannot free surface: still in use by another process"
    );
}

/// Log a failure while tearing down partial state.
#[inline]
pub fn trace_rollback_failed(id: BufferId, stage: &'static str, error: &Error) {
    tracing::warn!(
        id = %id,
        stage = stage,
        error = %error,
        "rollback step failed"
    );
}
