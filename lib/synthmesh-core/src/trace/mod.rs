//! Distributed trace context.
//!
//! Every hop of a request through the mesh gets a server span. The span's context is extracted from the inbound
//! request (unless this node is the root of the mesh), injected into each downstream call, and reported once the hop
//! finishes. Context travels in B3 multi-header form.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use http::{HeaderMap, HeaderName, HeaderValue};

mod reporter;
pub use self::reporter::{LogReporter, SpanReporter};

const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-b3-traceid");
const SPAN_ID_HEADER: HeaderName = HeaderName::from_static("x-b3-spanid");
const PARENT_SPAN_ID_HEADER: HeaderName = HeaderName::from_static("x-b3-parentspanid");
const SAMPLED_HEADER: HeaderName = HeaderName::from_static("x-b3-sampled");

/// Identifiers that tie a span into its trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpanContext {
    /// Trace identifier, shared by every span of the trace.
    pub trace_id: u128,

    /// Identifier of this span.
    pub span_id: u64,

    /// Identifier of the span that caused this one, if any.
    pub parent_id: Option<u64>,

    /// Whether spans of this trace are recorded.
    pub sampled: bool,
}

impl SpanContext {
    /// Returns the trace identifier in its hex wire form.
    pub fn trace_id_hex(&self) -> String {
        if self.trace_id >> 64 == 0 {
            format!("{:016x}", self.trace_id)
        } else {
            format!("{:032x}", self.trace_id)
        }
    }

    /// Returns the span identifier in its hex wire form.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }

    /// Returns the parent span identifier in its hex wire form, if any.
    pub fn parent_id_hex(&self) -> Option<String> {
        self.parent_id.map(|id| format!("{:016x}", id))
    }
}

/// A timestamped event recorded on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    /// When the event happened.
    pub timestamp: SystemTime,

    /// What happened.
    pub value: String,
}

/// An in-progress span.
pub struct Span {
    context: SpanContext,
    name: String,
    start: SystemTime,
    started: Instant,
    tags: Vec<(String, String)>,
    annotations: Vec<Annotation>,
}

impl Span {
    /// Returns the context of this span.
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    /// Returns the name of this span.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets a tag on the span, replacing any previous value for the same key.
    pub fn tag(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.tags.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.tags.push((key, value)),
        }
    }

    /// Records an event on the span at the current time.
    pub fn annotate(&mut self, value: impl Into<String>) {
        self.annotate_at(SystemTime::now(), value);
    }

    /// Records an event on the span at the given time.
    pub fn annotate_at(&mut self, timestamp: SystemTime, value: impl Into<String>) {
        self.annotations.push(Annotation {
            timestamp,
            value: value.into(),
        });
    }
}

/// A finished span, as handed to a [`SpanReporter`].
#[derive(Clone, Debug)]
pub struct FinishedSpan {
    /// Name of the service that recorded the span.
    pub service_name: Arc<str>,

    /// Span context.
    pub context: SpanContext,

    /// Span name.
    pub name: String,

    /// Wall-clock start time.
    pub start: SystemTime,

    /// How long the span lasted.
    pub duration: Duration,

    /// Span tags, in insertion order.
    pub tags: Vec<(String, String)>,

    /// Span annotations, in recording order.
    pub annotations: Vec<Annotation>,
}

impl FinishedSpan {
    /// Returns the value of the given tag, if set.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Handle for creating, propagating, and finishing spans.
///
/// Cloning a `Tracer` is cheap, and all clones report through the same [`SpanReporter`].
#[derive(Clone)]
pub struct Tracer {
    service_name: Arc<str>,
    sampling: bool,
    reporter: Arc<dyn SpanReporter>,
}

impl Tracer {
    /// Creates a new `Tracer` for the given service.
    ///
    /// When `sampling` is `false`, traces started here are not recorded. Traces continued from an upstream context
    /// follow the upstream sampling decision.
    pub fn new(service_name: impl Into<Arc<str>>, sampling: bool, reporter: Arc<dyn SpanReporter>) -> Self {
        Self {
            service_name: service_name.into(),
            sampling,
            reporter,
        }
    }

    /// Returns the service name spans are recorded under.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Starts a new span.
    ///
    /// With a parent, the span joins the parent's trace. Without one, a new trace is started.
    pub fn start(&self, name: impl Into<String>, parent: Option<&SpanContext>) -> Span {
        let context = match parent {
            Some(parent) => SpanContext {
                trace_id: parent.trace_id,
                span_id: new_span_id(),
                parent_id: Some(parent.span_id),
                sampled: parent.sampled,
            },
            None => SpanContext {
                trace_id: u128::from(new_span_id()),
                span_id: new_span_id(),
                parent_id: None,
                sampled: self.sampling,
            },
        };

        Span {
            context,
            name: name.into(),
            start: SystemTime::now(),
            started: Instant::now(),
            tags: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Extracts an upstream span context from request headers.
    ///
    /// Returns `None` if the headers carry no (or a malformed) trace context.
    pub fn extract(&self, headers: &HeaderMap) -> Option<SpanContext> {
        let trace_id = parse_hex_header(headers, &TRACE_ID_HEADER, 32).and_then(|id| u128::from_str_radix(id, 16).ok())?;
        let span_id = parse_hex_header(headers, &SPAN_ID_HEADER, 16).and_then(|id| u64::from_str_radix(id, 16).ok())?;
        let parent_id =
            parse_hex_header(headers, &PARENT_SPAN_ID_HEADER, 16).and_then(|id| u64::from_str_radix(id, 16).ok());
        let sampled = match headers.get(&SAMPLED_HEADER).and_then(|v| v.to_str().ok()) {
            Some("0") | Some("false") => false,
            Some(_) => true,
            None => self.sampling,
        };

        Some(SpanContext {
            trace_id,
            span_id,
            parent_id,
            sampled,
        })
    }

    /// Injects a span context into outbound request headers.
    pub fn inject(&self, context: &SpanContext, headers: &mut HeaderMap) {
        insert_header(headers, TRACE_ID_HEADER, context.trace_id_hex());
        insert_header(headers, SPAN_ID_HEADER, context.span_id_hex());
        if let Some(parent_id) = context.parent_id_hex() {
            insert_header(headers, PARENT_SPAN_ID_HEADER, parent_id);
        }
        insert_header(headers, SAMPLED_HEADER, if context.sampled { "1" } else { "0" }.to_string());
    }

    /// Finishes a span, reporting it if its trace is sampled.
    pub fn finish(&self, span: Span) {
        if !span.context.sampled {
            return;
        }

        self.reporter.report(FinishedSpan {
            service_name: Arc::clone(&self.service_name),
            context: span.context,
            name: span.name,
            start: span.start,
            duration: span.started.elapsed(),
            tags: span.tags,
            annotations: span.annotations,
        });
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.service_name)
            .field("sampling", &self.sampling)
            .finish()
    }
}

fn new_span_id() -> u64 {
    // Zero is reserved as "no id" by most tracing backends.
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

fn parse_hex_header<'a>(headers: &'a HeaderMap, name: &HeaderName, max_len: usize) -> Option<&'a str> {
    let value = headers.get(name)?.to_str().ok()?;
    if value.is_empty() || value.len() > max_len || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(value)
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: String) {
    // Hex digits and "0"/"1" are always valid header values.
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}
