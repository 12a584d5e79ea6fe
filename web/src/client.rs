//! Outbound HTTP: correlation header injection and a resilient `reqwest` client.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshguard_web::client::ResilientHttpClient;
//! use meshguard_web::extractors::Correlation;
//!
//! async fn handler(State(client): State<ResilientHttpClient>, correlation: Correlation) -> String {
//!     let response = client
//!         .get(correlation.context(), "http://inventory/api/stock/42")
//!         .await?;
//!     response.text().await?
//! }
//! ```

use crate::middleware::correlation_header;
use axum::http::{HeaderMap, HeaderValue, Request};
use meshguard_core::correlation::CorrelationContext;
use meshguard_core::error::{CallError, ResilienceError};
use meshguard_core::telemetry::{SharedMetrics, names, service_tag, tags};
use meshguard_runtime::pipeline::PolicyPipeline;
use std::task::{Context, Poll};
use tokio::time::Instant;
use tower::{Layer, Service};

/// Set the current correlation id on `headers`, replacing any existing value.
///
/// Returns `false` when the context is empty or the id is not a valid header value.
pub fn inject_correlation_header(headers: &mut HeaderMap, context: &CorrelationContext) -> bool {
    let Some(id) = context.get() else {
        return false;
    };
    let Ok(value) = HeaderValue::from_str(id.as_str()) else {
        tracing::warn!(correlation_id = %id, "Correlation id is not a valid header value");
        return false;
    };
    headers.insert(correlation_header(), value);
    tracing::debug!(correlation_id = %id, "Propagating correlation id");
    true
}

/// Layer injecting the [`CorrelationContext`] found in request extensions
/// into the outgoing request header.
#[derive(Clone, Copy, Debug, Default)]
pub struct PropagateCorrelationLayer;

impl<S> Layer<S> for PropagateCorrelationLayer {
    type Service = PropagateCorrelation<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PropagateCorrelation { inner }
    }
}

/// Service created by [`PropagateCorrelationLayer`].
#[derive(Clone, Debug)]
pub struct PropagateCorrelation<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for PropagateCorrelation<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if let Some(context) = req.extensions().get::<CorrelationContext>().cloned() {
            inject_correlation_header(req.headers_mut(), &context);
        }
        self.inner.call(req)
    }
}

/// Map a `reqwest` failure onto the failure taxonomy.
///
/// Connection, timeout and request-level I/O failures are transient; status
/// errors follow [`CallError::from_http_status`]; malformed requests, redirect
/// loops and undecodable bodies are not.
#[must_use]
pub fn classify_reqwest_error(err: &reqwest::Error) -> CallError {
    if let Some(status) = err.status() {
        return CallError::from_http_status(status.as_u16())
            .unwrap_or_else(|| CallError::non_transient(err.to_string()));
    }
    if err.is_builder() || err.is_redirect() || err.is_decode() {
        return CallError::non_transient(err.to_string());
    }
    CallError::transient(err.to_string())
}

/// `reqwest` client running every request through a [`PolicyPipeline`].
///
/// 408 and 5xx responses count as transient failures; every other response,
/// 4xx included, is returned to the caller.
#[derive(Clone)]
pub struct ResilientHttpClient {
    client: reqwest::Client,
    pipeline: PolicyPipeline,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for ResilientHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl ResilientHttpClient {
    /// Wrap `client` with `pipeline`.
    #[must_use]
    pub const fn new(client: reqwest::Client, pipeline: PolicyPipeline, metrics: SharedMetrics) -> Self {
        Self {
            client,
            pipeline,
            metrics,
        }
    }

    /// The pipeline requests run through.
    #[must_use]
    pub const fn pipeline(&self) -> &PolicyPipeline {
        &self.pipeline
    }

    /// `GET url`.
    ///
    /// # Errors
    ///
    /// As [`Self::send`].
    pub async fn get(
        &self,
        context: &CorrelationContext,
        url: &str,
    ) -> Result<reqwest::Response, ResilienceError> {
        self.send(context, |client| client.get(url)).await
    }

    /// Send the request produced by `build`, once per attempt.
    ///
    /// The correlation header is set on every attempt.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's [`ResilienceError`] when every layer gave up.
    pub async fn send<F>(
        &self,
        context: &CorrelationContext,
        build: F,
    ) -> Result<reqwest::Response, ResilienceError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let started = Instant::now();

        let result = self
            .pipeline
            .execute(|attempt| {
                let request = build(&self.client).build();
                async move {
                    let mut request = request.map_err(|err| classify_reqwest_error(&err))?;
                    inject_correlation_header(request.headers_mut(), context);
                    tracing::debug!(
                        service = %attempt.service,
                        attempt = attempt.attempt,
                        method = %request.method(),
                        url = %request.url(),
                        "Sending HTTP request"
                    );

                    let response = self
                        .client
                        .execute(request)
                        .await
                        .map_err(|err| classify_reqwest_error(&err))?;
                    match CallError::from_http_status(response.status().as_u16()) {
                        Some(err) => Err(err),
                        None => Ok(response),
                    }
                }
            })
            .await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record(
            names::REQUEST_DURATION_MS,
            elapsed_ms,
            &[
                service_tag(self.pipeline.service()),
                (tags::SUCCESS, result.is_ok().to_string()),
                (tags::PROTOCOL, "http".to_string()),
            ],
        );
        result
    }
}
