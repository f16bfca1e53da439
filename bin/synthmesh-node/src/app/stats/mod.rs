use std::sync::{Arc, Mutex};

use axum::{routing::get, Router};
use process_stats::Querier;

mod handlers;
use self::handlers::*;

pub fn build_stats_router(querier: Arc<Mutex<Querier>>) -> Router {
    Router::new()
        .route("/cpu", get(handle_cpu))
        .route("/memory", get(handle_memory))
        .route("/health", get(handle_health))
        .with_state(querier)
}
