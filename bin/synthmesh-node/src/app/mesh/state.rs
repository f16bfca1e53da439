use std::sync::Arc;

use synthmesh_core::{NodeEngine, RouteTable};

#[derive(Clone)]
pub struct MeshState {
    engine: Arc<NodeEngine>,
    routes: Arc<RouteTable>,
}

impl MeshState {
    /// Creates a new `MeshState` over the given engine and route table.
    pub fn new(engine: Arc<NodeEngine>, routes: Arc<RouteTable>) -> Self {
        Self { engine, routes }
    }

    /// Returns the node engine.
    pub fn engine(&self) -> &NodeEngine {
        &self.engine
    }

    /// Returns `true` if the route table defines the given route.
    pub fn has_route(&self, route_key: &str) -> bool {
        self.routes.contains_route(route_key)
    }
}
