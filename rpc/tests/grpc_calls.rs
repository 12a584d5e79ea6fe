//! RPC propagation and the RPC call class, driven without a network.
//!
//! Outbound requests are turned into the HTTP/2 request tonic would send so
//! the server admission layer sees exactly what a peer would receive.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use meshguard_core::CorrelationContext;
use meshguard_core::correlation::RPC_CORRELATION_KEY;
use meshguard_core::error::{CallError, PolicyLayer};
use meshguard_core::telemetry::names;
use meshguard_rpc::{CorrelationGrpcLayer, CorrelationServerInterceptor, ResilientGrpc, correlated_request};
use meshguard_runtime::options::ResiliencePolicyOptions;
use meshguard_testing::{LogCapture, RecordingMetrics};
use std::convert::Infallible;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tonic::service::Interceptor;
use tonic::{Code, Response, Status};
use tower::{Layer, ServiceExt};

// ============================================================================
// Fixtures
// ============================================================================

fn to_http(request: tonic::Request<String>, path: &str) -> http::Request<()> {
    let headers = request.metadata().clone().into_headers();
    let mut http_request = http::Request::builder().uri(path).body(()).unwrap();
    *http_request.headers_mut() = headers;
    http_request
}

async fn handler(request: http::Request<()>) -> Result<String, Infallible> {
    let id = request
        .extensions()
        .get::<CorrelationContext>()
        .and_then(CorrelationContext::get)
        .map(|id| id.to_string())
        .unwrap_or_default();
    tracing::info!("Handling call");
    Ok(id)
}

fn grpc(metrics: &RecordingMetrics) -> ResilientGrpc {
    ResilientGrpc::new("inventory", &ResiliencePolicyOptions::default(), metrics.shared())
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn outbound_id_reaches_server_handler() {
    let context = CorrelationContext::with_id("rpc-hop-1".try_into().unwrap());
    let request = correlated_request("sku-42".to_string(), &context);

    let server = CorrelationGrpcLayer.layer(tower::service_fn(handler));
    let seen = server
        .oneshot(to_http(request, "/inventory.Stock/Level"))
        .await
        .unwrap();

    assert_eq!(seen, "rpc-hop-1");
}

#[tokio::test]
async fn server_span_carries_correlation_id() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let context = CorrelationContext::with_id("rpc-hop-2".try_into().unwrap());
    let server = CorrelationGrpcLayer.layer(tower::service_fn(handler));
    server
        .oneshot(to_http(
            correlated_request(String::new(), &context),
            "/inventory.Stock/Watch",
        ))
        .await
        .unwrap();

    let lines = logs.lines_containing("Handling call");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("correlation_id=rpc-hop-2"), "{}", lines[0]);
    assert!(lines[0].contains("method=/inventory.Stock/Watch"), "{}", lines[0]);
}

#[test]
fn server_interceptor_generates_missing_id() {
    let request = CorrelationServerInterceptor
        .call(tonic::Request::new(()))
        .unwrap();

    let context = request.extensions().get::<CorrelationContext>().unwrap();
    assert!(context.get().is_some());
}

// ============================================================================
// RPC call class
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unavailable_is_retried_with_id_and_deadline_on_every_attempt() {
    let metrics = RecordingMetrics::new();
    let context = CorrelationContext::with_id("rpc-retry".try_into().unwrap());
    let attempts = AtomicU32::new(0);
    let seen = Mutex::new(Vec::new());

    let response = grpc(&metrics)
        .call(
            &context,
            || "sku-42".to_string(),
            |request| {
                let id = request
                    .metadata()
                    .get(RPC_CORRELATION_KEY)
                    .map(|value| value.to_str().unwrap().to_string());
                let has_deadline = request.metadata().get("grpc-timeout").is_some();
                seen.lock().unwrap().push((id, has_deadline));
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(Status::unavailable("restarting"))
                    } else {
                        Ok(Response::new(7_u32))
                    }
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(response.into_inner(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.count(names::RETRY_TOTAL), 2);
    for (id, has_deadline) in seen.into_inner().unwrap() {
        assert_eq!(id.as_deref(), Some("rpc-retry"));
        assert!(has_deadline);
    }

    let durations = metrics.events(names::REQUEST_DURATION_MS);
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].tag("protocol"), Some("grpc"));
    assert_eq!(durations[0].tag("success"), Some("true"));
}

#[tokio::test(start_paused = true)]
async fn invalid_argument_is_not_retried() {
    let metrics = RecordingMetrics::new();
    let attempts = AtomicU32::new(0);

    let err = grpc(&metrics)
        .call(
            &CorrelationContext::generate(),
            || (),
            |_request| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<Response<()>, _>(Status::invalid_argument("bad sku")) }
            },
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(err.layer, PolicyLayer::Transport);
    assert_eq!(err.attempts, 1);
    assert!(!err.cause.is_transient());
    assert_eq!(metrics.count(names::RETRY_TOTAL), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_exceeded_surfaces_as_timeout() {
    let metrics = RecordingMetrics::new();
    let client = grpc(&metrics);

    let err = client
        .call(
            &CorrelationContext::generate(),
            || (),
            |_request| async { Err::<Response<()>, _>(Status::new(Code::DeadlineExceeded, "slow")) },
        )
        .await
        .unwrap_err();

    assert_eq!(err.layer, PolicyLayer::Retry);
    assert_eq!(err.attempts, 4);
    assert_eq!(err.cause, CallError::TimeoutExceeded(Duration::from_secs(15)));
    let timeouts = metrics.events(names::TIMEOUT_TOTAL);
    assert_eq!(timeouts.len(), 4);
    assert!(timeouts.iter().all(|event| event.tag("service") == Some("inventory")));
    assert_eq!(
        metrics.events(names::REQUEST_DURATION_MS)[0].tag("success"),
        Some("false")
    );
}
