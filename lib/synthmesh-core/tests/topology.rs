//! Multi-node scenarios, with nodes wired together in memory.
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use synthmesh_core::{
    load::LoadSpec,
    trace::FinishedSpan,
    DispatchMode, DownstreamCaller, DownstreamError, DownstreamRequest, DownstreamResponse, NodeConfig, NodeEngine,
    NodeResponse, Request, RouteTable, SpanReporter, Tracer,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Recorder {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl Recorder {
    fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().unwrap().clone()
    }
}

impl SpanReporter for Recorder {
    fn report(&self, span: FinishedSpan) {
        self.spans.lock().unwrap().push(span);
    }
}

/// Routes downstream calls to other engines in the same process.
///
/// Calls to names with no registered node are answered with a 502, like a node that is up but failing.
#[derive(Default)]
struct Mesh {
    nodes: RwLock<HashMap<String, Arc<NodeEngine>>>,
    calls: Mutex<Vec<(String, String)>>,
    recorder: Arc<Recorder>,
}

impl Mesh {
    fn add_node(self: &Arc<Self>, config: NodeConfig, routes: &Arc<RouteTable>) -> Arc<NodeEngine> {
        let name = config.name().to_string();
        let tracer = Tracer::new(name.clone(), true, self.recorder.clone());
        let engine = Arc::new(NodeEngine::new(config, Arc::clone(routes), self.clone(), tracer));
        self.nodes.write().unwrap().insert(name, Arc::clone(&engine));
        engine
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownstreamCaller for Mesh {
    async fn call(&self, request: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.target.clone(), request.route_key.clone()));

        let node = self.nodes.read().unwrap().get(&request.target).cloned();
        let Some(node) = node else {
            return Ok(DownstreamResponse {
                status: StatusCode::BAD_GATEWAY,
                body: vec![0].into(),
            });
        };

        let mode = mode_for(&node, &request.route_key);
        let response = node
            .handle(
                Request {
                    route_key: request.route_key,
                    source: "mesh".to_string(),
                    payload: request.payload,
                    headers: request.headers,
                },
                mode,
            )
            .await;

        Ok(DownstreamResponse {
            status: response.status,
            body: response.body,
        })
    }
}

fn mode_for(node: &NodeEngine, route_key: &str) -> DispatchMode {
    match route_key {
        "all" => DispatchMode::Broadcast,
        "random" => DispatchMode::Random,
        "round-robin" => DispatchMode::RoundRobin,
        _ => node.config().dispatch_mode(),
    }
}

fn node(name: &str) -> synthmesh_core::NodeConfigBuilder {
    NodeConfig::builder(name)
        .with_load(LoadSpec::Fixed {
            cpu_duty_cycle: 0.2,
            memory_units: 0,
        })
        .with_process_time(Duration::from_millis(1))
        .with_parallelism(NonZeroUsize::MIN)
        .with_payload_size(32)
}

async fn send(engine: &NodeEngine, route_key: &str) -> NodeResponse {
    let request = Request {
        route_key: route_key.to_string(),
        source: "client".to_string(),
        payload: Default::default(),
        headers: HeaderMap::new(),
    };
    let mode = mode_for(engine, route_key);
    tokio::time::timeout(TEST_TIMEOUT, engine.handle(request, mode))
        .await
        .expect("request should complete")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn route_traversal_takes_exactly_two_hops() {
    let routes = Arc::new(
        RouteTable::from_yaml(
            r#"
r1:
  n0: n1
  n1: n2
  n2: ""
"#,
        )
        .unwrap(),
    );
    let mesh = Arc::new(Mesh::default());
    let n0 = mesh.add_node(node("n0").with_root(true).build().unwrap(), &routes);
    mesh.add_node(node("n1").build().unwrap(), &routes);
    mesh.add_node(node("n2").build().unwrap(), &routes);

    let response = send(&n0, "r1").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(!response.terminated);
    assert_eq!(response.next_hops, vec!["n1"]);
    assert_eq!(
        mesh.calls(),
        vec![("n1".to_string(), "r1".to_string()), ("n2".to_string(), "r1".to_string())]
    );

    let spans = mesh.recorder.spans();
    assert_eq!(spans.len(), 3);
    let trace_id = spans[0].context.trace_id;
    assert!(spans.iter().all(|span| span.context.trace_id == trace_id));

    let leaf = spans.iter().find(|span| &*span.service_name == "n2").unwrap();
    assert_eq!(leaf.tag("st.termination"), Some("true"));
    let root = spans.iter().find(|span| &*span.service_name == "n0").unwrap();
    assert_eq!(root.context.parent_id, None);
    assert_eq!(root.tag("target"), Some("n1"));

    // Every hop contributes its own payload to the response.
    let size_at = |name: &str| {
        spans
            .iter()
            .find(|span| &*span.service_name == name)
            .and_then(|span| span.tag("response.size_bytes"))
            .and_then(|size| size.parse::<usize>().ok())
            .unwrap()
    };
    assert_eq!(size_at("n0"), response.size_bytes());
    assert!(size_at("n0") > size_at("n1"));
    assert!(size_at("n1") > size_at("n2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_with_one_bad_target_is_bad_gateway() {
    let routes = Arc::new(RouteTable::new());
    let mesh = Arc::new(Mesh::default());
    let n0 = mesh.add_node(
        node("n0")
            .with_root(true)
            .with_targets(["ok1", "ok2", "bad"])
            .build()
            .unwrap(),
        &routes,
    );
    mesh.add_node(node("ok1").build().unwrap(), &routes);
    mesh.add_node(node("ok2").build().unwrap(), &routes);

    let response = send(&n0, "all").await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(&response.body[..], &[0]);
    assert!(mesh.calls().iter().any(|(target, _)| target == "bad"));
    assert_eq!(n0.in_flight(), 0);

    let root = mesh
        .recorder
        .spans()
        .into_iter()
        .find(|span| &*span.service_name == "n0")
        .unwrap();
    assert_eq!(root.tag("http.status_code"), Some("502"));
    assert!(root.tag("error").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_aggregates_every_target() {
    let routes = Arc::new(RouteTable::new());
    let mesh = Arc::new(Mesh::default());
    let n0 = mesh.add_node(
        node("n0")
            .with_root(true)
            .with_payload_size(0)
            .with_targets(["a", "b", "c"])
            .build()
            .unwrap(),
        &routes,
    );
    for name in ["a", "b", "c"] {
        mesh.add_node(node(name).build().unwrap(), &routes);
    }

    let response = send(&n0, "all").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.next_hops, vec!["a", "b", "c"]);

    let leaf_bytes = mesh
        .recorder
        .spans()
        .iter()
        .filter(|span| &*span.service_name != "n0")
        .map(|span| span.tag("response.size_bytes").unwrap().parse::<usize>().unwrap())
        .sum::<usize>();
    assert!(response.size_bytes() >= leaf_bytes);
}

#[tokio::test]
async fn node_missing_from_route_is_a_leaf() {
    let routes = Arc::new(RouteTable::new().with_hop("r1", "n5", "n6"));
    let mesh = Arc::new(Mesh::default());
    let n0 = mesh.add_node(node("n0").with_root(true).with_targets(["n1"]).build().unwrap(), &routes);
    mesh.add_node(node("n1").build().unwrap(), &routes);

    let response = send(&n0, "r1").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.terminated);
    assert!(response.next_hops.is_empty());
    assert!(mesh.calls().is_empty());

    let spans = mesh.recorder.spans();
    assert_eq!(spans[0].tag("st.termination"), Some("true"));
}

#[tokio::test]
async fn round_robin_cycles_through_nodes() {
    let routes = Arc::new(RouteTable::new());
    let mesh = Arc::new(Mesh::default());
    let n0 = mesh.add_node(
        node("n0").with_root(true).with_targets(["A", "B", "C"]).build().unwrap(),
        &routes,
    );
    for name in ["A", "B", "C"] {
        mesh.add_node(node(name).build().unwrap(), &routes);
    }

    for _ in 0..4 {
        assert_eq!(send(&n0, "round-robin").await.status, StatusCode::OK);
    }

    let targets = mesh.calls().into_iter().map(|(target, _)| target).collect::<Vec<_>>();
    assert_eq!(targets, vec!["A", "B", "C", "A"]);
}
