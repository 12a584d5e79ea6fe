//! Inbound correlation middleware for axum.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use meshguard_web::middleware::correlation_layer;
//!
//! let app = Router::new()
//!     .route("/api/orders", post(create_order))
//!     .layer(correlation_layer());
//! ```
//!
//! # Flow
//!
//! 1. **Resolve** the id: `X-Correlation-ID` header, else the request's own
//!    trace id (`RequestId` extension or `x-request-id`), else a new UUID
//! 2. **Store** a [`CorrelationContext`] and the [`CorrelationId`] in request extensions
//! 3. **Run** the handler inside an `http_request` span carrying `correlation_id`
//! 4. **Log** start, completion (level by status), slow requests and failures
//! 5. **Echo** the id on the response unless a handler already set it

use crate::extractors::{client_ip, user_agent};
use axum::{
    extract::{ConnectInfo, Request},
    http::{Extensions, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use meshguard_core::correlation::{CORRELATION_ID_HEADER, CorrelationContext, CorrelationId};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};
use tower_http::request_id::RequestId;
use tracing::Instrument;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Inbound telemetry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundOptions {
    /// Requests slower than this are logged at warning level, whatever their status.
    pub slow_request_threshold_ms: u64,
}

impl Default for InboundOptions {
    fn default() -> Self {
        Self {
            slow_request_threshold_ms: 5000,
        }
    }
}

impl InboundOptions {
    /// Slow-request threshold.
    #[must_use]
    pub const fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }
}

/// Correlation layer with default [`InboundOptions`].
#[must_use]
pub fn correlation_layer() -> CorrelationLayer {
    CorrelationLayer::default()
}

/// Layer establishing a correlation context for every inbound request.
#[derive(Clone, Debug, Default)]
pub struct CorrelationLayer {
    options: InboundOptions,
}

impl CorrelationLayer {
    /// Layer with custom settings.
    #[must_use]
    pub const fn with_options(options: InboundOptions) -> Self {
        Self { options }
    }
}

impl<S> Layer<S> for CorrelationLayer {
    type Service = CorrelationMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationMiddleware {
            inner,
            options: self.options,
        }
    }
}

/// Middleware service created by [`CorrelationLayer`].
#[derive(Clone, Debug)]
pub struct CorrelationMiddleware<S> {
    inner: S,
    options: InboundOptions,
}

impl<S> Service<Request> for CorrelationMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let correlation_id = resolve_correlation_id(req.headers(), req.extensions());
        let context = CorrelationContext::with_id(correlation_id.clone());
        req.extensions_mut().insert(context);
        req.extensions_mut().insert(correlation_id.clone());

        let client_ip = client_ip(
            req.headers(),
            req.extensions().get::<ConnectInfo<SocketAddr>>(),
        );
        let user_agent = user_agent(req.headers());
        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            path = %req.uri().path(),
            client_ip = %client_ip,
        );
        let slow_threshold = self.options.slow_request_threshold();
        let threshold_ms = self.options.slow_request_threshold_ms;

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                tracing::info!(user_agent = %user_agent, "HTTP request started");
                let started = Instant::now();

                let result = fut.await;

                let elapsed = started.elapsed();
                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                if elapsed > slow_threshold {
                    tracing::warn!(
                        duration_ms,
                        threshold_ms,
                        "Slow HTTP request"
                    );
                }

                match result {
                    Ok(mut response) => {
                        log_completion(&response, duration_ms);
                        echo_correlation_id(response.headers_mut(), &correlation_id);
                        Ok(response)
                    }
                    Err(err) => {
                        tracing::error!(duration_ms, error = %err, "HTTP request failed");
                        Err(err)
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Correlation id for an inbound request.
///
/// Priority: `X-Correlation-ID` header, `RequestId` extension, `x-request-id`
/// header, new UUID. Blank values are skipped.
#[must_use]
pub fn resolve_correlation_id(headers: &HeaderMap, extensions: &Extensions) -> CorrelationId {
    header_id(headers, CORRELATION_ID_HEADER)
        .or_else(|| {
            extensions
                .get::<RequestId>()
                .and_then(|id| id.header_value().to_str().ok())
                .and_then(|value| CorrelationId::parse(value).ok())
        })
        .or_else(|| header_id(headers, REQUEST_ID_HEADER))
        .unwrap_or_else(CorrelationId::generate)
}

fn header_id(headers: &HeaderMap, name: &str) -> Option<CorrelationId> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| CorrelationId::parse(value).ok())
}

fn echo_correlation_id(headers: &mut HeaderMap, correlation_id: &CorrelationId) {
    if headers.contains_key(CORRELATION_ID_HEADER) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        headers.insert(correlation_header(), value);
    }
}

fn log_completion(response: &Response, duration_ms: u64) {
    let status = response.status();
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), duration_ms, "HTTP request completed");
    } else if status.is_client_error() {
        tracing::warn!(status = status.as_u16(), duration_ms, "HTTP request completed");
    } else {
        tracing::info!(status = status.as_u16(), duration_ms, "HTTP request completed");
    }
}

pub(crate) fn correlation_header() -> HeaderName {
    HeaderName::from_static("x-correlation-id")
}
