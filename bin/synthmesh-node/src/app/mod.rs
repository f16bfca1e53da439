use std::sync::{Arc, Mutex};

use axum::{http::Uri, Router};
use process_stats::Querier;
use synthmesh_core::{NodeEngine, RouteTable};
use tracing::debug;

mod mesh;
mod stats;

pub fn initialize_app_router(engine: Arc<NodeEngine>, routes: Arc<RouteTable>) -> Router {
    Router::new()
        .merge(mesh::build_mesh_router(engine, routes))
        .merge(stats::build_stats_router(Arc::new(Mutex::new(Querier::default()))))
        .fallback(not_found_handler)
}

async fn not_found_handler(uri: Uri) -> axum::http::StatusCode {
    debug!("Got request for unknown path: path={}", uri);

    axum::http::StatusCode::NOT_FOUND
}
