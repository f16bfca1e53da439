//! Request lifecycle of a mesh node.
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::{
    admission::AdmissionQueue,
    config::NodeConfig,
    dispatch::{DispatchCall, DispatchMode, Dispatcher},
    downstream::DownstreamCaller,
    load::ResourceSimulator,
    payload::{PayloadGenerator, SharedRng},
    route::RouteTable,
    trace::{Span, Tracer},
};

/// Body returned in place of a payload when a request fails.
pub const FAILURE_SENTINEL: &[u8] = &[0];

/// Where a request is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    /// Holding an admission slot.
    Admitted,

    /// Local CPU and memory load has been applied.
    Loaded,

    /// Handed to the dispatch strategy.
    Dispatched,

    /// Downstream responses have been combined with the local payload.
    Aggregated,

    /// The response is ready and the admission slot has been released.
    Completed,

    /// The request was rejected at admission or failed downstream.
    Failed,
}

impl RequestState {
    /// Returns the name of this state, as recorded on spans.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Loaded => "loaded",
            Self::Dispatched => "dispatched",
            Self::Aggregated => "aggregated",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound request.
#[derive(Clone, Debug, Default)]
pub struct Request {
    /// Route key the request arrived under.
    pub route_key: String,

    /// Address of the caller.
    pub source: String,

    /// Request body. Treated as opaque.
    pub payload: Bytes,

    /// Inbound metadata, carrying the upstream trace context.
    pub headers: HeaderMap,
}

/// The node's answer to a request.
#[derive(Clone, Debug)]
pub struct NodeResponse {
    /// Response status.
    pub status: StatusCode,

    /// Local payload followed by the aggregated downstream payloads.
    pub body: Bytes,

    /// Downstream targets the request was sent on to.
    pub next_hops: Vec<String>,

    /// Whether this node was the end of the line for the request.
    pub terminated: bool,

    /// Final lifecycle state.
    pub state: RequestState,
}

impl NodeResponse {
    fn failed(status: StatusCode, next_hops: Vec<String>) -> Self {
        Self {
            status,
            body: Bytes::from_static(FAILURE_SENTINEL),
            next_hops,
            terminated: false,
            state: RequestState::Failed,
        }
    }

    /// Returns the size of the response body, in bytes.
    pub fn size_bytes(&self) -> usize {
        self.body.len()
    }
}

/// Runs requests through admission, local load, downstream dispatch, and aggregation.
///
/// A single engine is shared by every in-flight request on a node. All process-wide state (configuration, route table,
/// tracer, dispatch cursor, random source) lives here rather than in globals.
pub struct NodeEngine {
    config: Arc<NodeConfig>,
    admission: Arc<AdmissionQueue<u64>>,
    simulator: Arc<ResourceSimulator>,
    dispatcher: Dispatcher,
    payloads: PayloadGenerator,
    tracer: Tracer,
    next_request_id: AtomicU64,
}

impl NodeEngine {
    /// Creates a new `NodeEngine`.
    pub fn new(
        config: NodeConfig, routes: Arc<RouteTable>, caller: Arc<dyn DownstreamCaller>, tracer: Tracer,
    ) -> Self {
        let rng = SharedRng::from_seed(config.random_seed());
        let dispatcher = Dispatcher::new(
            config.name(),
            config.targets().to_vec(),
            routes,
            rng.clone(),
            caller,
            config.downstream_timeout(),
        );

        Self {
            admission: Arc::new(AdmissionQueue::new(config.admission_capacity())),
            simulator: Arc::new(ResourceSimulator::new(config.parallelism(), config.memory_unit_size())),
            payloads: PayloadGenerator::new(config.payload_size(), rng),
            dispatcher,
            tracer,
            next_request_id: AtomicU64::new(0),
            config: Arc::new(config),
        }
    }

    /// Returns the node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Returns the tracer spans are recorded with.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Returns the admission queue capacity.
    pub fn capacity(&self) -> usize {
        self.admission.capacity()
    }

    /// Returns the number of requests currently admitted.
    pub fn in_flight(&self) -> usize {
        self.admission.len()
    }

    /// Stops admitting requests and cancels outstanding downstream calls.
    pub fn shutdown(&self) {
        self.admission.close();
        self.dispatcher.shutdown();
    }

    /// Handles a request end to end, dispatching downstream according to `mode`.
    ///
    /// The span for the request is finished, and any admission slot released, on every exit path, including the
    /// returned future being dropped partway through.
    pub async fn handle(&self, request: Request, mode: DispatchMode) -> NodeResponse {
        let parent = if self.config.is_root() {
            None
        } else {
            self.tracer.extract(&request.headers)
        };

        let mut span = ActiveSpan {
            tracer: &self.tracer,
            span: Some(self.tracer.start(request.route_key.as_str(), parent.as_ref())),
        };
        span.tag("node", self.config.name());
        span.tag("route", &request.route_key);
        span.tag("source", &request.source);
        span.tag("dispatch.mode", mode);
        span.tag("request.size_bytes", request.payload.len());

        let request_id = self.next_request_id.fetch_add(1, Relaxed);
        let response = self.process(request_id, request, mode, &mut span).await;

        span.tag("st.termination", response.terminated);
        span.tag("target", response.next_hops.join(","));
        span.tag("response.size_bytes", response.size_bytes());
        span.tag("http.status_code", response.status.as_u16());
        self.transition(&mut span, request_id, response.state);

        response
    }

    async fn process(&self, request_id: u64, request: Request, mode: DispatchMode, span: &mut Span) -> NodeResponse {
        let slot = match self.admission.admit(request_id, self.config.admission_timeout()).await {
            Ok(slot) => slot,
            Err(e) => {
                warn!(route = %request.route_key, error = %e, "Request was not admitted.");
                span.tag("error", &e);
                return NodeResponse::failed(StatusCode::SERVICE_UNAVAILABLE, Vec::new());
            }
        };
        self.transition(span, request_id, RequestState::Admitted);

        let profile = self.config.load().profile();
        let process_time = self.config.process_time();
        span.tag("cpu.duty_cycle", profile.cpu_duty_cycle);
        span.tag("memory.units", profile.memory_units);
        let slot = if !process_time.is_zero() || profile.memory_units > 0 {
            // The slot rides along with the blocking load, so capacity is only restored once the load has actually
            // finished, even if this future is dropped in the meantime.
            let simulator = Arc::clone(&self.simulator);
            let loaded = tokio::task::spawn_blocking(move || {
                let elapsed = simulator.simulate(&profile, process_time);
                (elapsed, slot)
            })
            .await;
            match loaded {
                Ok((elapsed, slot)) => {
                    span.tag("load.elapsed_ms", elapsed.as_millis());
                    slot
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    warn!(route = %request.route_key, error = %e, "Local load did not complete.");
                    span.tag("error", &e);
                    return NodeResponse::failed(StatusCode::SERVICE_UNAVAILABLE, Vec::new());
                }
            }
        } else {
            slot
        };
        self.transition(span, request_id, RequestState::Loaded);

        let local = self.payloads.next_payload();
        let mut headers = HeaderMap::new();
        self.tracer.inject(span.context(), &mut headers);
        let call = DispatchCall {
            route_key: request.route_key.clone(),
            payload: local.clone(),
            headers,
        };

        self.transition(span, request_id, RequestState::Dispatched);
        let result = self.dispatcher.dispatch(mode, call).await;
        for hop in &result.hops {
            span.tag(format!("hop.{}", hop.target), if hop.ok { "ok" } else { "failed" });
        }

        if let Some(e) = &result.error {
            warn!(route = %request.route_key, error = %e, "Downstream dispatch failed.");
            span.tag("error", e);
            return NodeResponse::failed(StatusCode::BAD_GATEWAY, result.next_hops);
        }

        let mut body = BytesMut::with_capacity(local.len() + result.body.len());
        body.extend_from_slice(&local);
        body.extend_from_slice(&result.body);
        self.transition(span, request_id, RequestState::Aggregated);

        drop(slot);
        debug!(
            route = %request.route_key,
            bytes = body.len(),
            terminated = result.is_leaf(),
            "Request completed."
        );

        NodeResponse {
            status: StatusCode::OK,
            body: body.freeze(),
            terminated: result.is_leaf(),
            next_hops: result.next_hops,
            state: RequestState::Completed,
        }
    }

    fn transition(&self, span: &mut Span, request_id: u64, state: RequestState) {
        debug!(request_id, %state, "Request state changed.");
        span.annotate(state.as_str());
    }
}

impl Drop for NodeEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Finishes its span when dropped.
struct ActiveSpan<'a> {
    tracer: &'a Tracer,
    span: Option<Span>,
}

impl Deref for ActiveSpan<'_> {
    type Target = Span;

    fn deref(&self) -> &Span {
        // Only taken in `drop`.
        self.span.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for ActiveSpan<'_> {
    fn deref_mut(&mut self) -> &mut Span {
        self.span.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ActiveSpan<'_> {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            self.tracer.finish(span);
        }
    }
}
