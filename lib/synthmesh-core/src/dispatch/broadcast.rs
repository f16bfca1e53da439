use bytes::{Bytes, BytesMut};
use tokio::task::JoinSet;
use tracing::debug;

use super::{DispatchCall, DispatchResult, DispatchStatus, Dispatcher, HopOutcome};
use crate::downstream::{call_with_timeout, DownstreamError, DownstreamRequest};

/// Calls every target concurrently and concatenates the response bodies in target order.
///
/// The first failure to complete fails the whole dispatch: calls still outstanding are cancelled and their results
/// discarded.
pub(super) async fn dispatch_all(dispatcher: &Dispatcher, targets: Vec<String>, call: DispatchCall) -> DispatchResult {
    let cancel_token = dispatcher.shutdown.child_token();
    let mut calls = JoinSet::new();

    for (idx, target) in targets.iter().enumerate() {
        let caller = dispatcher.caller.clone();
        let call_timeout = dispatcher.call_timeout;
        let cancel_token = cancel_token.clone();
        let request = DownstreamRequest {
            target: target.clone(),
            route_key: call.route_key.clone(),
            payload: call.payload.clone(),
            headers: call.headers.clone(),
        };

        calls.spawn(async move {
            let target = request.target.clone();
            let result = tokio::select! {
                result = call_with_timeout(caller.as_ref(), request, call_timeout) => result,
                _ = cancel_token.cancelled() => Err(DownstreamError::Cancelled { target }),
            };
            (idx, result)
        });
    }

    let mut bodies: Vec<Option<Bytes>> = vec![None; targets.len()];
    let mut hops = Vec::with_capacity(targets.len());

    while let Some(joined) = calls.join_next().await {
        let (idx, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => continue,
        };

        match result {
            Ok(body) => {
                hops.push(HopOutcome {
                    target: targets[idx].clone(),
                    ok: true,
                    response_bytes: body.len(),
                });
                bodies[idx] = Some(body);
            }
            Err(e) => {
                debug!(downstream = %targets[idx], error = %e, "Broadcast call failed. Cancelling remaining calls.");
                cancel_token.cancel();
                calls.abort_all();

                hops.push(HopOutcome {
                    target: targets[idx].clone(),
                    ok: false,
                    response_bytes: 0,
                });
                return DispatchResult {
                    status: DispatchStatus::BadGateway,
                    body: Bytes::new(),
                    next_hops: targets,
                    hops,
                    error: Some(e),
                };
            }
        }
    }

    let total = bodies.iter().flatten().map(Bytes::len).sum();
    let mut body = BytesMut::with_capacity(total);
    for part in bodies.into_iter().flatten() {
        body.extend_from_slice(&part);
    }

    DispatchResult {
        status: DispatchStatus::Ok,
        body: body.freeze(),
        next_hops: targets,
        hops,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering::SeqCst},
            Arc,
        },
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        dispatch::{test_support::EchoCaller, DispatchMode},
        downstream::{DownstreamCaller, DownstreamResponse},
        payload::SharedRng,
        route::RouteTable,
    };

    fn dispatcher(targets: &[&str], caller: Arc<dyn DownstreamCaller>, call_timeout: Duration) -> Dispatcher {
        Dispatcher::new(
            "n0",
            targets.iter().map(|t| t.to_string()).collect(),
            Arc::new(RouteTable::new()),
            SharedRng::from_seed(42),
            caller,
            call_timeout,
        )
    }

    fn call() -> DispatchCall {
        DispatchCall {
            route_key: "all".to_string(),
            payload: Bytes::from_static(b"x"),
            headers: HeaderMap::new(),
        }
    }

    /// Holds back "slow" until one of the other targets has been called.
    struct StaggeredCaller {
        release: Notify,
    }

    #[async_trait]
    impl DownstreamCaller for StaggeredCaller {
        async fn call(&self, request: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError> {
            if request.target == "slow" {
                self.release.notified().await;
            } else {
                self.release.notify_one();
            }
            Ok(DownstreamResponse {
                status: StatusCode::OK,
                body: request.target.into_bytes().into(),
            })
        }
    }

    /// Never answers.
    struct HangingCaller;

    #[async_trait]
    impl DownstreamCaller for HangingCaller {
        async fn call(&self, _: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError> {
            std::future::pending().await
        }
    }

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, SeqCst);
        }
    }

    /// "hang" never answers; "bad" fails as soon as "hang" is in flight.
    #[derive(Default)]
    struct FailFastCaller {
        hang_started: Notify,
        hang_dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DownstreamCaller for FailFastCaller {
        async fn call(&self, request: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError> {
            if request.target == "hang" {
                let _flag = DropFlag(Arc::clone(&self.hang_dropped));
                self.hang_started.notify_one();
                std::future::pending::<()>().await;
            }

            self.hang_started.notified().await;
            Ok(DownstreamResponse {
                status: StatusCode::BAD_GATEWAY,
                body: Bytes::from_static(&[0]),
            })
        }
    }

    #[tokio::test]
    async fn aggregates_in_target_order() {
        let caller = Arc::new(StaggeredCaller { release: Notify::new() });
        let dispatcher = dispatcher(&["slow", "b", "c"], caller, Duration::from_secs(5));

        let result = dispatcher.dispatch(DispatchMode::Broadcast, call()).await;
        assert!(result.is_ok());
        assert_eq!(&result.body[..], b"slowbc");
        assert_eq!(result.hops.len(), 3);
        assert_eq!(result.next_hops, vec!["slow", "b", "c"]);
    }

    #[tokio::test]
    async fn one_failing_target_fails_the_broadcast() {
        let caller = Arc::new(EchoCaller::failing(&["bad"]));
        let dispatcher = dispatcher(&["ok1", "ok2", "bad"], caller, Duration::from_secs(5));

        let result = dispatcher.dispatch(DispatchMode::Broadcast, call()).await;
        assert_eq!(result.status, DispatchStatus::BadGateway);
        assert!(result.body.is_empty());
        assert!(result.hops.iter().any(|hop| hop.target == "bad" && !hop.ok));
    }

    #[tokio::test]
    async fn failure_cancels_outstanding_siblings() {
        let caller = Arc::new(FailFastCaller::default());
        let dispatcher = dispatcher(&["bad", "hang"], caller.clone(), Duration::from_secs(60));

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), dispatcher.dispatch(DispatchMode::Broadcast, call()))
            .await
            .expect("broadcast should fail without waiting on the hanging target");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(result.status, DispatchStatus::BadGateway);
        assert!(matches!(result.error, Some(DownstreamError::UnexpectedStatus { .. })));
        assert!(result.hops.iter().all(|hop| hop.target == "bad" && !hop.ok));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !caller.hang_dropped.load(SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("hanging call should be dropped");
    }

    #[tokio::test]
    async fn stuck_targets_time_out() {
        let dispatcher = dispatcher(&["a", "b"], Arc::new(HangingCaller), Duration::from_millis(20));

        let result = tokio::time::timeout(Duration::from_secs(5), dispatcher.dispatch(DispatchMode::Broadcast, call()))
            .await
            .expect("broadcast should give up on stuck targets");
        assert_eq!(result.status, DispatchStatus::BadGateway);
        assert!(matches!(result.error, Some(DownstreamError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_calls() {
        let dispatcher = Arc::new(dispatcher(&["a", "b"], Arc::new(HangingCaller), Duration::from_secs(60)));

        let handle = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(DispatchMode::Broadcast, call()).await }
        });
        tokio::task::yield_now().await;
        dispatcher.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(result.status, DispatchStatus::BadGateway);
        assert!(matches!(result.error, Some(DownstreamError::Cancelled { .. })));
    }
}
