//! Calls to downstream mesh nodes.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use snafu::Snafu;

/// A downstream call error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DownstreamError {
    /// The call failed at the transport level.
    #[snafu(display("failed to call downstream target '{}': {}", target, source))]
    Transport {
        /// Target address.
        target: String,

        /// Source of the error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The target answered with a non-OK status.
    #[snafu(display("downstream target '{}' responded with status {}", target, status))]
    UnexpectedStatus {
        /// Target address.
        target: String,

        /// Response status.
        status: StatusCode,
    },

    /// The target did not answer in time.
    #[snafu(display("downstream target '{}' did not respond within {:?}", target, timeout))]
    TimedOut {
        /// Target address.
        target: String,

        /// Call deadline.
        timeout: Duration,
    },

    /// The call was abandoned because a sibling call failed.
    #[snafu(display("call to downstream target '{}' was cancelled", target))]
    Cancelled {
        /// Target address.
        target: String,
    },
}

/// A call to a downstream node.
#[derive(Clone, Debug)]
pub struct DownstreamRequest {
    /// Target address.
    pub target: String,

    /// Route key the downstream node should dispatch on.
    pub route_key: String,

    /// Request body.
    pub payload: Bytes,

    /// Outbound metadata, including the propagated trace context.
    pub headers: HeaderMap,
}

/// A downstream node's answer.
#[derive(Clone, Debug)]
pub struct DownstreamResponse {
    /// Response status.
    pub status: StatusCode,

    /// Response body.
    pub body: Bytes,
}

/// Transport used to reach downstream nodes.
#[async_trait]
pub trait DownstreamCaller: Send + Sync {
    /// Calls a downstream node.
    ///
    /// A response with a non-OK status is still a successful call at this level.
    ///
    /// # Errors
    ///
    /// If the target cannot be reached, or the exchange fails partway, an error is returned.
    async fn call(&self, request: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError>;
}

/// Calls a downstream node with a deadline, treating any non-OK status as a failure.
pub(crate) async fn call_with_timeout(
    caller: &dyn DownstreamCaller, request: DownstreamRequest, timeout: Duration,
) -> Result<Bytes, DownstreamError> {
    let target = request.target.clone();
    match tokio::time::timeout(timeout, caller.call(request)).await {
        Err(_) => Err(DownstreamError::TimedOut { target, timeout }),
        Ok(Err(e)) => Err(e),
        Ok(Ok(response)) if response.status == StatusCode::OK => Ok(response.body),
        Ok(Ok(response)) => Err(DownstreamError::UnexpectedStatus {
            target,
            status: response.status,
        }),
    }
}
