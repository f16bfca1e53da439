//! Node engine for a synthetic service mesh.
//!
//! A node admits a request, burns a configurable amount of CPU and memory, fans the request out to its downstream
//! targets, and answers with its own synthetic payload followed by whatever came back from downstream. Many nodes
//! wired together reproduce an arbitrary call topology with controllable per-hop cost.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod downstream;
pub mod engine;
pub mod error;
pub mod load;
pub mod payload;
pub mod route;
pub mod trace;

pub use self::{
    config::{ConfigError, NodeConfig, NodeConfigBuilder},
    dispatch::{DispatchMode, DispatchResult, DispatchStatus},
    downstream::{DownstreamCaller, DownstreamError, DownstreamRequest, DownstreamResponse},
    engine::{NodeEngine, NodeResponse, Request, RequestState},
    route::{RouteTable, RouteTableError},
    trace::{LogReporter, SpanReporter, Tracer},
};
