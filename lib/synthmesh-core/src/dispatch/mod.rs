//! Downstream dispatch strategies.
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use http::HeaderMap;
use rand::Rng as _;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    downstream::{call_with_timeout, DownstreamCaller, DownstreamError, DownstreamRequest},
    payload::SharedRng,
    route::RouteTable,
};

mod broadcast;

/// How a node picks the downstream targets of a request.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DispatchMode {
    /// One target per request, cycling through the targets in order.
    RoundRobin,

    /// One target per request, chosen uniformly at random.
    Random,

    /// Every target, concurrently.
    Broadcast,

    /// The next hop of the request's route, as given by the route table.
    #[default]
    RouteTable,
}

impl DispatchMode {
    /// Returns the canonical name of this mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::Broadcast => "broadcast",
            Self::RouteTable => "route-table",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown dispatch mode.
#[derive(Debug, Snafu)]
#[snafu(display("unknown dispatch mode '{}' (expected round-robin, random, broadcast, or route-table)", mode))]
pub struct UnknownDispatchMode {
    mode: String,
}

impl FromStr for DispatchMode {
    type Err = UnknownDispatchMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "broadcast" | "all" => Ok(Self::Broadcast),
            "route-table" | "route" => Ok(Self::RouteTable),
            other => Err(UnknownDispatchMode { mode: other.to_string() }),
        }
    }
}

/// Overall outcome of a dispatch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// Every downstream call succeeded, or none was needed.
    Ok,

    /// A downstream call failed.
    BadGateway,
}

/// Outcome of a single downstream call.
#[derive(Clone, Debug, PartialEq)]
pub struct HopOutcome {
    /// Target that was called.
    pub target: String,

    /// Whether the call succeeded.
    pub ok: bool,

    /// Size of the response body, in bytes.
    pub response_bytes: usize,
}

/// Aggregated result of dispatching a request downstream.
#[derive(Debug)]
pub struct DispatchResult {
    /// Overall status.
    pub status: DispatchStatus,

    /// Concatenated downstream response bodies.
    pub body: Bytes,

    /// Targets selected for this request, in selection order.
    pub next_hops: Vec<String>,

    /// Per-target outcomes, for every call that finished before the dispatch did.
    pub hops: Vec<HopOutcome>,

    /// The error that failed the dispatch, if any.
    pub error: Option<DownstreamError>,
}

impl DispatchResult {
    /// Result for a node that is the end of the line for this request.
    pub fn leaf() -> Self {
        Self {
            status: DispatchStatus::Ok,
            body: Bytes::new(),
            next_hops: Vec::new(),
            hops: Vec::new(),
            error: None,
        }
    }

    /// Returns `true` if no downstream call was attempted.
    pub fn is_leaf(&self) -> bool {
        self.next_hops.is_empty()
    }

    /// Returns `true` if the dispatch succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == DispatchStatus::Ok
    }
}

/// A request to be sent downstream.
#[derive(Clone, Debug)]
pub struct DispatchCall {
    /// Route key downstream nodes should handle the request under.
    pub route_key: String,

    /// Body to send downstream.
    pub payload: Bytes,

    /// Outbound metadata.
    pub headers: HeaderMap,
}

/// Picks downstream targets for requests and calls them.
///
/// The round-robin cursor is the only mutable state, and is advanced atomically so a single `Dispatcher` can be shared
/// by every in-flight request on a node.
pub struct Dispatcher {
    node_id: String,
    targets: Vec<String>,
    routes: Arc<RouteTable>,
    cursor: AtomicUsize,
    rng: SharedRng,
    caller: Arc<dyn DownstreamCaller>,
    call_timeout: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Creates a new `Dispatcher`.
    pub fn new(
        node_id: impl Into<String>, targets: Vec<String>, routes: Arc<RouteTable>, rng: SharedRng,
        caller: Arc<dyn DownstreamCaller>, call_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            targets,
            routes,
            cursor: AtomicUsize::new(0),
            rng,
            caller,
            call_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the configured downstream targets.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Cancels every outstanding downstream call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Selects the targets `call` should go to under `mode`.
    ///
    /// An empty selection means this node is the leaf for the request.
    pub fn select(&self, mode: DispatchMode, route_key: &str) -> Vec<String> {
        match mode {
            DispatchMode::RoundRobin => self.next_round_robin().into_iter().collect(),
            DispatchMode::Random => self.next_random().into_iter().collect(),
            DispatchMode::Broadcast => self.targets.clone(),
            DispatchMode::RouteTable => self
                .routes
                .next_hop(route_key, &self.node_id)
                .map(str::to_string)
                .into_iter()
                .collect(),
        }
    }

    /// Dispatches a request according to `mode`.
    pub async fn dispatch(&self, mode: DispatchMode, call: DispatchCall) -> DispatchResult {
        let targets = self.select(mode, &call.route_key);
        match targets.len() {
            0 => {
                debug!(route = %call.route_key, %mode, "No downstream target selected. Terminating here.");
                DispatchResult::leaf()
            }
            1 if mode != DispatchMode::Broadcast => self.call_single(targets, call).await,
            _ => broadcast::dispatch_all(self, targets, call).await,
        }
    }

    async fn call_single(&self, mut targets: Vec<String>, call: DispatchCall) -> DispatchResult {
        let target = targets.remove(0);
        let request = DownstreamRequest {
            target: target.clone(),
            route_key: call.route_key,
            payload: call.payload,
            headers: call.headers,
        };

        let result = tokio::select! {
            result = call_with_timeout(self.caller.as_ref(), request, self.call_timeout) => result,
            _ = self.shutdown.cancelled() => Err(DownstreamError::Cancelled { target: target.clone() }),
        };

        match result {
            Ok(body) => DispatchResult {
                status: DispatchStatus::Ok,
                hops: vec![HopOutcome {
                    target: target.clone(),
                    ok: true,
                    response_bytes: body.len(),
                }],
                body,
                next_hops: vec![target],
                error: None,
            },
            Err(e) => DispatchResult {
                status: DispatchStatus::BadGateway,
                body: Bytes::new(),
                hops: vec![HopOutcome {
                    target: target.clone(),
                    ok: false,
                    response_bytes: 0,
                }],
                next_hops: vec![target],
                error: Some(e),
            },
        }
    }

    fn next_round_robin(&self) -> Option<String> {
        if self.targets.is_empty() {
            return None;
        }

        let idx = self.cursor.fetch_add(1, Relaxed) % self.targets.len();
        Some(self.targets[idx].clone())
    }

    fn next_random(&self) -> Option<String> {
        if self.targets.is_empty() {
            return None;
        }

        let idx = self.rng.with(|rng| rng.random_range(0..self.targets.len()));
        Some(self.targets[idx].clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{collections::HashSet, sync::Mutex};

    use async_trait::async_trait;
    use http::StatusCode;

    use crate::downstream::{DownstreamCaller, DownstreamError, DownstreamRequest, DownstreamResponse};

    /// Answers every call with the target's name as the body, and a 502 for targets it has been told are bad.
    #[derive(Default)]
    pub struct EchoCaller {
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl EchoCaller {
        pub fn failing(targets: &[&str]) -> Self {
            Self {
                failing: targets.iter().map(|t| t.to_string()).collect(),
                calls: Mutex::default(),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DownstreamCaller for EchoCaller {
        async fn call(&self, request: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError> {
            self.calls.lock().unwrap().push(request.target.clone());
            let status = if self.failing.contains(&request.target) {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };

            Ok(DownstreamResponse {
                status,
                body: request.target.into_bytes().into(),
            })
        }
    }
}
