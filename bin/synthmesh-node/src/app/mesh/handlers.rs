use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse as _, Response},
};
use synthmesh_core::{DispatchMode, NodeResponse, Request};
use tracing::debug;

use super::MeshState;

const NEXT_HOP: HeaderName = HeaderName::from_static("next-hop");
const ST_TERMINATION: HeaderName = HeaderName::from_static("st-termination");
const ST_SIZE_BYTES: HeaderName = HeaderName::from_static("st-size-bytes");

pub async fn handle_route(
    State(state): State<MeshState>, ConnectInfo(source): ConnectInfo<SocketAddr>, Path(route_key): Path<String>,
    headers: HeaderMap, body: Bytes,
) -> Response {
    if !state.has_route(&route_key) {
        debug!(route = %route_key, "Received request for unknown route.");
        return StatusCode::NOT_FOUND.into_response();
    }

    let mode = state.engine().config().dispatch_mode();
    handle(&state, route_key, mode, source, headers, body).await
}

pub async fn handle_all(
    State(state): State<MeshState>, ConnectInfo(source): ConnectInfo<SocketAddr>, headers: HeaderMap, body: Bytes,
) -> Response {
    handle(&state, "all".to_string(), DispatchMode::Broadcast, source, headers, body).await
}

pub async fn handle_random(
    State(state): State<MeshState>, ConnectInfo(source): ConnectInfo<SocketAddr>, headers: HeaderMap, body: Bytes,
) -> Response {
    handle(&state, "random".to_string(), DispatchMode::Random, source, headers, body).await
}

pub async fn handle_round_robin(
    State(state): State<MeshState>, ConnectInfo(source): ConnectInfo<SocketAddr>, headers: HeaderMap, body: Bytes,
) -> Response {
    handle(&state, "round-robin".to_string(), DispatchMode::RoundRobin, source, headers, body).await
}

async fn handle(
    state: &MeshState, route_key: String, mode: DispatchMode, source: SocketAddr, headers: HeaderMap, payload: Bytes,
) -> Response {
    debug!(route = %route_key, %mode, %source, bytes = payload.len(), "Received request.");

    let request = Request {
        route_key,
        source: source.to_string(),
        payload,
        headers,
    };
    let response = state.engine().handle(request, mode).await;
    into_http_response(response)
}

fn into_http_response(response: NodeResponse) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(
        ST_TERMINATION,
        HeaderValue::from_static(if response.terminated { "true" } else { "false" }),
    );

    let size_bytes = if response.status == StatusCode::OK {
        response.size_bytes()
    } else {
        0
    };
    headers.insert(ST_SIZE_BYTES, HeaderValue::from(size_bytes));

    if !response.next_hops.is_empty() {
        if let Ok(next_hop) = HeaderValue::from_str(&response.next_hops.join(",")) {
            headers.insert(NEXT_HOP, next_hop);
        }
    }

    (response.status, headers, response.body).into_response()
}
