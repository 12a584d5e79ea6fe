//! Outbound correlation and resilience for tonic clients.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshguard_rpc::client::{CorrelationClientInterceptor, ResilientGrpc};
//!
//! let channel = Channel::from_static("http://inventory:50051").connect().await?;
//! let mut stock = StockClient::with_interceptor(
//!     channel,
//!     CorrelationClientInterceptor::new(correlation.clone()),
//! );
//!
//! let grpc = ResilientGrpc::new("inventory", &options, metrics);
//! let level = grpc
//!     .call(
//!         &correlation,
//!         || StockQuery { sku: sku.clone() },
//!         |request| {
//!             let mut stock = stock.clone();
//!             async move { stock.level(request).await }
//!         },
//!     )
//!     .await?;
//! ```

use crate::metadata::with_correlation;
use meshguard_core::correlation::CorrelationContext;
use meshguard_core::error::{CallError, ResilienceError};
use meshguard_core::telemetry::{SharedMetrics, names, service_tag, tags};
use meshguard_runtime::options::ResiliencePolicyOptions;
use meshguard_runtime::pipeline::PolicyPipeline;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::service::Interceptor;
use tonic::{Code, Request, Response, Status};

/// Client interceptor attaching the current correlation id to every call.
///
/// The interceptor runs once per call for every call shape, on the initial
/// request metadata.
#[derive(Clone, Debug, Default)]
pub struct CorrelationClientInterceptor {
    context: CorrelationContext,
}

impl CorrelationClientInterceptor {
    /// Propagate the id held by `context`.
    #[must_use]
    pub const fn new(context: CorrelationContext) -> Self {
        Self { context }
    }
}

impl Interceptor for CorrelationClientInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(id) = self.context.get() {
            *request.metadata_mut() = with_correlation(request.metadata(), &id);
            tracing::debug!(correlation_id = %id, "Propagating correlation id");
        }
        Ok(request)
    }
}

/// Wrap `message` in a request carrying the current correlation id.
pub fn correlated_request<T>(message: T, context: &CorrelationContext) -> Request<T> {
    let mut request = Request::new(message);
    if let Some(id) = context.get() {
        *request.metadata_mut() = with_correlation(request.metadata(), &id);
    }
    request
}

/// Map a tonic status onto the failure taxonomy.
///
/// `Unavailable`, `DeadlineExceeded`, `ResourceExhausted` and `Aborted` are
/// transient. Everything else is not.
#[must_use]
pub fn classify_status(status: &Status) -> CallError {
    let reason = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted => {
            CallError::transient(reason)
        }
        _ => CallError::non_transient(reason),
    }
}

/// Runs tonic calls through the RPC pipeline with a per-call deadline.
#[derive(Clone)]
pub struct ResilientGrpc {
    pipeline: PolicyPipeline,
    deadline: Duration,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for ResilientGrpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientGrpc")
            .field("pipeline", &self.pipeline)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl ResilientGrpc {
    /// RPC call class for `service` with the configured deadline.
    #[must_use]
    pub fn new(
        service: impl Into<Arc<str>>,
        options: &ResiliencePolicyOptions,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            pipeline: PolicyPipeline::grpc(service, options, Arc::clone(&metrics)),
            deadline: options.grpc.deadline(),
            metrics,
        }
    }

    /// Use an already built pipeline.
    #[must_use]
    pub const fn from_pipeline(pipeline: PolicyPipeline, deadline: Duration, metrics: SharedMetrics) -> Self {
        Self {
            pipeline,
            deadline,
            metrics,
        }
    }

    /// The pipeline calls run through.
    #[must_use]
    pub const fn pipeline(&self) -> &PolicyPipeline {
        &self.pipeline
    }

    /// Deadline set on every attempt.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run one logical call.
    ///
    /// `build` produces the request message for each attempt. Every attempt
    /// carries the correlation id and the deadline.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's [`ResilienceError`] when every layer gave up.
    pub async fn call<Req, T, B, C, Fut>(
        &self,
        context: &CorrelationContext,
        mut build: B,
        mut call: C,
    ) -> Result<Response<T>, ResilienceError>
    where
        B: FnMut() -> Req,
        C: FnMut(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<T>, Status>>,
    {
        let started = Instant::now();
        let deadline = self.deadline;
        let metrics = &self.metrics;

        let result = self
            .pipeline
            .execute(|attempt| {
                let mut request = correlated_request(build(), context);
                request.set_timeout(deadline);
                tracing::debug!(
                    service = %attempt.service,
                    attempt = attempt.attempt,
                    "Sending RPC request"
                );
                let pending = call(request);
                async move {
                    pending.await.map_err(|status| {
                        if status.code() == Code::DeadlineExceeded {
                            tracing::warn!(
                                service = %attempt.service,
                                attempt = attempt.attempt,
                                timeout_secs = deadline.as_secs_f64(),
                                "RPC deadline exceeded"
                            );
                            metrics.increment(names::TIMEOUT_TOTAL, &[service_tag(&attempt.service)]);
                            CallError::TimeoutExceeded(deadline)
                        } else {
                            classify_status(&status)
                        }
                    })
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
                (tags::PROTOCOL, "grpc".to_string()),
            ],
        );
        result
    }
}
