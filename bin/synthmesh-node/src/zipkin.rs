use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use synthmesh_core::{trace::FinishedSpan, SpanReporter};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

const SPAN_CHANNEL_CAPACITY: usize = 4096;
const MAX_BATCH_SIZE: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Reports spans to a Zipkin-compatible collector over its v2 JSON API.
///
/// Spans are handed to a background task, which exports them in batches. If the task falls behind, new spans are
/// dropped rather than blocking the request path.
pub struct ZipkinReporter {
    spans_tx: mpsc::Sender<FinishedSpan>,
}

impl ZipkinReporter {
    /// Creates a new `ZipkinReporter` exporting to the collector at `endpoint` (`host:port`).
    ///
    /// Returns the reporter and a handle to the export task. The task flushes any remaining spans and exits once every
    /// reporter handle has been dropped.
    pub fn spawn(endpoint: &str, client: reqwest::Client) -> (Self, JoinHandle<()>) {
        let (spans_tx, spans_rx) = mpsc::channel(SPAN_CHANNEL_CAPACITY);
        let url = format!("http://{}/api/v2/spans", endpoint);
        let handle = tokio::spawn(run_exporter(spans_rx, client, url));

        (Self { spans_tx }, handle)
    }
}

impl SpanReporter for ZipkinReporter {
    fn report(&self, span: FinishedSpan) {
        if self.spans_tx.try_send(span).is_err() {
            debug!("Span export queue full or closed. Dropping span.");
        }
    }
}

async fn run_exporter(mut spans_rx: mpsc::Receiver<FinishedSpan>, client: reqwest::Client, url: String) {
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            maybe_span = spans_rx.recv() => match maybe_span {
                Some(span) => {
                    batch.push(ZipkinSpan::from(&span));
                    if batch.len() >= MAX_BATCH_SIZE {
                        export(&client, &url, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = flush.tick() => export(&client, &url, &mut batch).await,
        }
    }

    export(&client, &url, &mut batch).await;
    debug!("Span exporter stopped.");
}

async fn export(client: &reqwest::Client, url: &str, batch: &mut Vec<ZipkinSpan>) {
    if batch.is_empty() {
        return;
    }

    let body = match serde_json::to_vec(&batch) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to encode spans. Dropping batch.");
            batch.clear();
            return;
        }
    };
    let count = batch.len();
    batch.clear();

    let result = client
        .post(url)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => debug!(count, "Exported spans."),
        Ok(response) => warn!(count, status = %response.status(), "Span collector rejected batch."),
        Err(e) => warn!(count, error = %e, "Failed to export spans."),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinSpan {
    trace_id: String,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    name: String,
    kind: &'static str,
    timestamp: u64,
    duration: u64,
    local_endpoint: LocalEndpoint,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<ZipkinAnnotation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalEndpoint {
    service_name: String,
}

#[derive(Debug, Serialize)]
struct ZipkinAnnotation {
    timestamp: u64,
    value: String,
}

impl From<&FinishedSpan> for ZipkinSpan {
    fn from(span: &FinishedSpan) -> Self {
        Self {
            trace_id: span.context.trace_id_hex(),
            id: span.context.span_id_hex(),
            parent_id: span.context.parent_id_hex(),
            name: span.name.clone(),
            kind: "SERVER",
            timestamp: micros_since_epoch(span.start),
            // Zipkin treats a zero duration as "unknown".
            duration: (span.duration.as_micros() as u64).max(1),
            local_endpoint: LocalEndpoint {
                service_name: span.service_name.to_string(),
            },
            tags: span.tags.iter().cloned().collect(),
            annotations: span
                .annotations
                .iter()
                .map(|annotation| ZipkinAnnotation {
                    timestamp: micros_since_epoch(annotation.timestamp),
                    value: annotation.value.clone(),
                })
                .collect(),
        }
    }
}

fn micros_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use synthmesh_core::trace::{Annotation, SpanContext};

    use super::*;

    fn finished_span(parent_id: Option<u64>) -> FinishedSpan {
        FinishedSpan {
            service_name: Arc::from("svc-1"),
            context: SpanContext {
                trace_id: 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736,
                span_id: 0x00f0_67aa_0ba9_02b7,
                parent_id,
                sampled: true,
            },
            name: "r1".to_string(),
            start: UNIX_EPOCH + Duration::from_secs(1),
            duration: Duration::from_millis(12),
            tags: vec![("st.termination".to_string(), "true".to_string())],
            annotations: vec![Annotation {
                timestamp: UNIX_EPOCH + Duration::from_secs(2),
                value: "admitted".to_string(),
            }],
        }
    }

    #[test]
    fn encodes_v2_json() {
        let span = ZipkinSpan::from(&finished_span(Some(0xabc)));
        let json = serde_json::to_value(&span).unwrap();

        assert_eq!(json["traceId"], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(json["id"], "00f067aa0ba902b7");
        assert_eq!(json["parentId"], "0000000000000abc");
        assert_eq!(json["name"], "r1");
        assert_eq!(json["kind"], "SERVER");
        assert_eq!(json["timestamp"], 1_000_000);
        assert_eq!(json["duration"], 12_000);
        assert_eq!(json["localEndpoint"]["serviceName"], "svc-1");
        assert_eq!(json["tags"]["st.termination"], "true");
        assert_eq!(json["annotations"][0]["timestamp"], 2_000_000);
        assert_eq!(json["annotations"][0]["value"], "admitted");
    }

    #[test]
    fn root_spans_have_no_parent() {
        let json = serde_json::to_value(ZipkinSpan::from(&finished_span(None))).unwrap();
        assert!(json.get("parentId").is_none());
    }

    #[tokio::test]
    async fn exporter_stops_when_reporters_are_dropped() {
        // Nothing listens on this port, so exports fail and are logged.
        let (reporter, handle) = ZipkinReporter::spawn("127.0.0.1:9", reqwest::Client::new());
        reporter.report(finished_span(None));
        drop(reporter);

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("exporter should stop")
            .unwrap();
    }
}
