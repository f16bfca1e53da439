use std::sync::Arc;

use axum::{routing::post, Router};
use synthmesh_core::{NodeEngine, RouteTable};

mod handlers;
use self::handlers::*;

mod state;
use self::state::MeshState;

pub fn build_mesh_router(engine: Arc<NodeEngine>, routes: Arc<RouteTable>) -> Router {
    Router::new()
        // Fixed-mode entry points over the configured targets.
        .route("/all", post(handle_all))
        .route("/random", post(handle_random))
        .route("/round-robin", post(handle_round_robin))
        // One entry point per route key, dispatched with the configured mode.
        .route("/{route_key}", post(handle_route))
        .with_state(MeshState::new(engine, routes))
}
