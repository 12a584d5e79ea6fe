//! End-to-end correlation propagation over real loopback HTTP.
//!
//! A downstream axum server echoes the correlation header it received; the
//! gateway under test runs `CorrelationLayer` and calls downstream through
//! `ResilientHttpClient`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    routing::get,
};
use meshguard_core::correlation::CORRELATION_ID_HEADER;
use meshguard_core::error::PolicyLayer;
use meshguard_core::telemetry::{SharedMetrics, names};
use meshguard_runtime::circuit_breaker::CircuitBreakerConfig;
use meshguard_runtime::pipeline::PolicyPipeline;
use meshguard_runtime::retry::RetryPolicy;
use meshguard_testing::RecordingMetrics;
use meshguard_web::{Correlation, ResilientHttpClient, correlation_layer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

// ============================================================================
// Fixtures
// ============================================================================

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn downstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/echo",
            get(|headers: HeaderMap| async move {
                headers
                    .get(CORRELATION_ID_HEADER)
                    .map(|value| value.to_str().unwrap().to_string())
                    .unwrap_or_default()
            }),
        )
        .route(
            "/flaky",
            get(|State(calls): State<Arc<AtomicUsize>>| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    (StatusCode::SERVICE_UNAVAILABLE, "try again")
                } else {
                    (StatusCode::OK, "ok")
                }
            }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(Arc::clone(&flaky_calls));
    (spawn(app).await, flaky_calls)
}

fn fast_pipeline(metrics: SharedMetrics) -> PolicyPipeline {
    PolicyPipeline::builder("downstream", metrics)
        .circuit_breaker(CircuitBreakerConfig::simple(5, Duration::from_secs(30)))
        .retry(
            RetryPolicy::builder()
                .max_retries(3)
                .base_delay(Duration::from_millis(1))
                .max_jitter(Duration::ZERO)
                .build(),
        )
        .timeout(Duration::from_secs(5))
        .build()
}

#[derive(Clone)]
struct Gateway {
    client: ResilientHttpClient,
    base: String,
}

fn gateway(addr: SocketAddr, metrics: &RecordingMetrics) -> Router {
    let client = ResilientHttpClient::new(
        reqwest::Client::new(),
        fast_pipeline(metrics.shared()),
        metrics.shared(),
    );
    let state = Gateway {
        client,
        base: format!("http://{addr}"),
    };

    Router::new()
        .route(
            "/proxy",
            get(|State(gateway): State<Gateway>, correlation: Correlation| async move {
                gateway
                    .client
                    .get(correlation.context(), &format!("{}/echo", gateway.base))
                    .await
                    .unwrap()
                    .text()
                    .await
                    .unwrap()
            }),
        )
        .with_state(state)
        .layer(correlation_layer())
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn generated_id_is_echoed_and_propagated() {
    let (addr, _) = downstream().await;
    let metrics = RecordingMetrics::new();

    let response = gateway(addr, &metrics)
        .oneshot(Request::builder().uri("/proxy").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let echoed = response
        .headers()
        .get(CORRELATION_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let seen_downstream = body_text(response).await;

    assert!(!echoed.is_empty());
    assert_eq!(seen_downstream, echoed);
}

#[tokio::test]
async fn inbound_id_is_never_replaced() {
    let (addr, _) = downstream().await;
    let metrics = RecordingMetrics::new();

    let response = gateway(addr, &metrics)
        .oneshot(
            Request::builder()
                .uri("/proxy")
                .header(CORRELATION_ID_HEADER, "checkout-2024-0001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap(),
        "checkout-2024-0001"
    );
    assert_eq!(body_text(response).await, "checkout-2024-0001");

    let durations = metrics.events(names::REQUEST_DURATION_MS);
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].tag("success"), Some("true"));
    assert_eq!(durations[0].tag("protocol"), Some("http"));
}

// ============================================================================
// Resilience
// ============================================================================

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let (addr, flaky_calls) = downstream().await;
    let metrics = RecordingMetrics::new();
    let client = ResilientHttpClient::new(
        reqwest::Client::new(),
        fast_pipeline(metrics.shared()),
        metrics.shared(),
    );
    let context = meshguard_core::CorrelationContext::generate();

    let response = client
        .get(&context, &format!("http://{addr}/flaky"))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.count(names::RETRY_TOTAL), 2);
}

#[tokio::test]
async fn client_errors_are_returned_without_retry() {
    let (addr, _) = downstream().await;
    let metrics = RecordingMetrics::new();
    let client = ResilientHttpClient::new(
        reqwest::Client::new(),
        fast_pipeline(metrics.shared()),
        metrics.shared(),
    );

    let response = client
        .get(
            &meshguard_core::CorrelationContext::generate(),
            &format!("http://{addr}/missing"),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(metrics.count(names::RETRY_TOTAL), 0);
}

#[tokio::test]
async fn unreachable_host_fails_at_retry_layer() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let metrics = RecordingMetrics::new();
    let client = ResilientHttpClient::new(
        reqwest::Client::new(),
        fast_pipeline(metrics.shared()),
        metrics.shared(),
    );

    let err = client
        .get(
            &meshguard_core::CorrelationContext::generate(),
            &format!("http://{addr}/echo"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.layer, PolicyLayer::Retry);
    assert_eq!(err.attempts, 4);
    assert!(err.cause.is_transient());
    assert_eq!(
        metrics.events(names::REQUEST_DURATION_MS)[0].tag("success"),
        Some("false")
    );
}
