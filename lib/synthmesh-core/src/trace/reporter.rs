use tracing::info;

use super::FinishedSpan;

/// A sink for finished spans.
///
/// Reporting happens inline on the request path, so implementations should hand spans off rather than block on
/// exporting them.
pub trait SpanReporter: Send + Sync {
    /// Reports a finished span.
    fn report(&self, span: FinishedSpan);
}

/// Reports finished spans as log events.
#[derive(Debug, Default)]
pub struct LogReporter;

impl SpanReporter for LogReporter {
    fn report(&self, span: FinishedSpan) {
        info!(
            service = %span.service_name,
            trace_id = %span.context.trace_id_hex(),
            span_id = %span.context.span_id_hex(),
            parent_id = ?span.context.parent_id_hex(),
            name = %span.name,
            duration_ms = span.duration.as_secs_f64() * 1000.0,
            tags = ?span.tags,
            "Span finished."
        );
    }
}
