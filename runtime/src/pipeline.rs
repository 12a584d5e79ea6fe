//! Composition of the protective layers into one executable pipeline.
//!
//! Layers always run in the same nominal order, outermost first:
//!
//! ```text
//! Bulkhead ─► CircuitBreaker ─► Retry ─► Timeout ─► transport call
//! ```
//!
//! - The bulkhead sheds load before a breaker or retry slot is consumed.
//! - The breaker wraps the whole retry loop and records one outcome per call.
//! - The timeout bounds every individual attempt, retries included.
//!
//! Call classes pick which layers are present:
//!
//! | Class      | Layers                                                   |
//! |------------|----------------------------------------------------------|
//! | standard   | simple breaker, retry, timeout                           |
//! | critical   | bulkhead, advanced breaker, retry (fewer), timeout (longer) |
//! | custom     | simple breaker, retry, timeout with caller-chosen values |
//! | grpc       | advanced breaker, retry (deadline left to the channel)   |
//! | per-service| standard with the overrides configured for that service  |
//!
//! # Example
//!
//! ```rust
//! use meshguard_core::{CallError, NoopMetrics};
//! use meshguard_runtime::options::ResiliencePolicyOptions;
//! use meshguard_runtime::pipeline::PolicyPipeline;
//!
//! # async fn example() {
//! let options = ResiliencePolicyOptions::default();
//! let pipeline = PolicyPipeline::standard("inventory", &options, NoopMetrics::shared());
//!
//! let stock = pipeline
//!     .execute(|ctx| async move {
//!         tracing::debug!(attempt = ctx.attempt, "calling inventory");
//!         Ok::<_, CallError>(12)
//!     })
//!     .await;
//! # }
//! ```

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::failure::layer_for;
use crate::fallback::Fallback;
use crate::options::{AdvancedBreakerOptions, ResiliencePolicyOptions};
use crate::retry::{Retry, RetryAttemptContext, RetryPolicy};
use crate::timeout::Timeout;
use meshguard_core::error::{CallError, PolicyLayer, ResilienceError};
use meshguard_core::telemetry::SharedMetrics;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Caller-chosen values for the custom call class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomPolicy {
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Consecutive failures that open the breaker
    pub circuit_breaker_threshold: u32,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// How long the breaker stays open
    pub break_duration: Duration,
}

impl CustomPolicy {
    /// Custom values with the default 30 second break duration.
    #[must_use]
    pub const fn new(retry_count: u32, circuit_breaker_threshold: u32, timeout: Duration) -> Self {
        Self {
            retry_count,
            circuit_breaker_threshold,
            timeout,
            break_duration: Duration::from_secs(30),
        }
    }

    /// Override the break duration.
    #[must_use]
    pub const fn break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = duration;
        self
    }
}

/// Builder for [`PolicyPipeline`]. The order of calls does not matter; the
/// built pipeline always runs its layers in the nominal order.
pub struct PipelineBuilder {
    service: Arc<str>,
    metrics: SharedMetrics,
    bulkhead: Option<BulkheadConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl PipelineBuilder {
    /// Add a bulkhead.
    #[must_use]
    pub const fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    /// Add a circuit breaker.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Add a retry layer.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Add a per-attempt timeout.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Build the pipeline.
    #[must_use]
    pub fn build(self) -> PolicyPipeline {
        let service = self.service;
        let metrics = self.metrics;
        PolicyPipeline {
            bulkhead: self
                .bulkhead
                .map(|config| Bulkhead::new(Arc::clone(&service), config, Arc::clone(&metrics))),
            circuit_breaker: self.circuit_breaker.map(|config| {
                CircuitBreaker::new(Arc::clone(&service), config, Arc::clone(&metrics))
            }),
            retry: self
                .retry
                .map(|policy| Retry::new(Arc::clone(&service), policy, Arc::clone(&metrics))),
            timeout: self
                .timeout
                .map(|duration| Timeout::new(Arc::clone(&service), duration, Arc::clone(&metrics))),
            service,
        }
    }
}

/// Immutable, ordered composition of protective layers for one logical client.
///
/// Build once and reuse for every call. Clones share breaker and bulkhead state.
#[derive(Clone)]
pub struct PolicyPipeline {
    service: Arc<str>,
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<Retry>,
    timeout: Option<Timeout>,
}

impl fmt::Debug for PolicyPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyPipeline")
            .field("service", &self.service)
            .field("layers", &self.layers())
            .finish()
    }
}

impl PolicyPipeline {
    /// Start building a pipeline with no layers.
    #[must_use]
    pub fn builder(service: impl Into<Arc<str>>, metrics: SharedMetrics) -> PipelineBuilder {
        PipelineBuilder {
            service: service.into(),
            metrics,
            bulkhead: None,
            circuit_breaker: None,
            retry: None,
            timeout: None,
        }
    }

    /// Standard calls: simple breaker, retry, timeout.
    #[must_use]
    pub fn standard(
        service: impl Into<Arc<str>>,
        options: &ResiliencePolicyOptions,
        metrics: SharedMetrics,
    ) -> Self {
        let http = &options.http;
        Self::builder(service, metrics)
            .circuit_breaker(CircuitBreakerConfig::simple(
                http.circuit_breaker_threshold,
                http.circuit_breaker_duration(),
            ))
            .retry(RetryPolicy::with_retries(http.retry_count))
            .timeout(http.timeout())
            .build()
    }

    /// Critical calls: bulkhead, advanced breaker, fewer retries, longer timeout.
    #[must_use]
    pub fn critical(
        service: impl Into<Arc<str>>,
        options: &ResiliencePolicyOptions,
        metrics: SharedMetrics,
    ) -> Self {
        let critical = &options.critical;
        Self::builder(service, metrics)
            .bulkhead(BulkheadConfig::new(
                critical.max_parallelization,
                critical.max_queuing_actions,
            ))
            .circuit_breaker(advanced_breaker(&critical.breaker))
            .retry(RetryPolicy::with_retries(critical.retry_count))
            .timeout(critical.timeout())
            .build()
    }

    /// Custom calls: caller-chosen values, standard order.
    #[must_use]
    pub fn custom(service: impl Into<Arc<str>>, policy: CustomPolicy, metrics: SharedMetrics) -> Self {
        Self::builder(service, metrics)
            .circuit_breaker(CircuitBreakerConfig::simple(
                policy.circuit_breaker_threshold,
                policy.break_duration,
            ))
            .retry(RetryPolicy::with_retries(policy.retry_count))
            .timeout(policy.timeout)
            .build()
    }

    /// RPC calls: advanced breaker and retry. The per-call deadline is set on
    /// the request instead of a timeout layer.
    #[must_use]
    pub fn grpc(
        service: impl Into<Arc<str>>,
        options: &ResiliencePolicyOptions,
        metrics: SharedMetrics,
    ) -> Self {
        let grpc = &options.grpc;
        Self::builder(service, metrics)
            .circuit_breaker(advanced_breaker(&grpc.breaker))
            .retry(RetryPolicy::with_retries(grpc.retry_count))
            .build()
    }

    /// Standard pipeline with the per-service overrides for `service`, if any.
    #[must_use]
    pub fn for_service(
        service: impl Into<Arc<str>>,
        options: &ResiliencePolicyOptions,
        metrics: SharedMetrics,
    ) -> Self {
        let service: Arc<str> = service.into();
        let Some(overrides) = options.service(&service) else {
            return Self::standard(service, options, metrics);
        };

        let http = &options.http;
        let breaker = if overrides.use_advanced_circuit_breaker {
            advanced_breaker(&options.grpc.breaker)
        } else {
            CircuitBreakerConfig::simple(
                overrides
                    .circuit_breaker_threshold
                    .unwrap_or(http.circuit_breaker_threshold),
                http.circuit_breaker_duration(),
            )
        };

        let mut builder = Self::builder(service, metrics)
            .circuit_breaker(breaker)
            .retry(RetryPolicy::with_retries(
                overrides.retry_count.unwrap_or(http.retry_count),
            ))
            .timeout(
                overrides
                    .timeout_secs
                    .map_or_else(|| http.timeout(), Duration::from_secs),
            );
        if overrides.enable_bulkhead {
            builder = builder.bulkhead(BulkheadConfig::new(
                http.max_parallelization,
                http.max_queuing_actions,
            ));
        }
        builder.build()
    }

    /// Logical downstream service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Layers present, outermost first.
    #[must_use]
    pub fn layers(&self) -> Vec<PolicyLayer> {
        [
            self.bulkhead.as_ref().map(|_| PolicyLayer::Bulkhead),
            self.circuit_breaker.as_ref().map(|_| PolicyLayer::CircuitBreaker),
            self.retry.as_ref().map(|_| PolicyLayer::Retry),
            self.timeout.as_ref().map(|_| PolicyLayer::Timeout),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// The circuit breaker, if present.
    #[must_use]
    pub const fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// The bulkhead, if present.
    #[must_use]
    pub const fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// The retry layer, if present.
    #[must_use]
    pub const fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    /// The timeout layer, if present.
    #[must_use]
    pub const fn timeout(&self) -> Option<&Timeout> {
        self.timeout.as_ref()
    }

    /// Run `operation` through every layer.
    ///
    /// `operation` is invoked once per attempt with that attempt's context.
    ///
    /// # Errors
    ///
    /// Returns one [`ResilienceError`] naming the layer that gave up, the
    /// number of attempts made, and the original cause.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut(RetryAttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let operation = &mut operation;
        match &self.bulkhead {
            Some(bulkhead) => bulkhead.execute(move || self.guarded(operation)).await,
            None => self.guarded(operation).await,
        }
    }

    /// Run `operation` and substitute the fallback on terminal failure.
    pub async fn execute_or_fallback<F, Fut, T>(&self, fallback: &Fallback<T>, operation: F) -> T
    where
        F: FnMut(RetryAttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        fallback.apply(self.execute(operation).await)
    }

    async fn guarded<F, Fut, T>(&self, operation: &mut F) -> Result<T, ResilienceError>
    where
        F: FnMut(RetryAttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        match &self.circuit_breaker {
            Some(breaker) => breaker.execute(move || self.attempts(operation)).await,
            None => self.attempts(operation).await,
        }
    }

    async fn attempts<F, Fut, T>(&self, operation: &mut F) -> Result<T, ResilienceError>
    where
        F: FnMut(RetryAttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let timeout = self.timeout.as_ref();
        let mut attempt = |context: RetryAttemptContext| {
            let call = operation(context);
            async move {
                match timeout {
                    Some(timeout) => timeout.execute(call).await,
                    None => call.await,
                }
            }
        };

        match &self.retry {
            Some(retry) => retry.execute(attempt).await,
            None => attempt(RetryAttemptContext::first(Arc::clone(&self.service)))
                .await
                .map_err(|cause| ResilienceError {
                    service: self.service.to_string(),
                    layer: layer_for(&cause, false),
                    attempts: 1,
                    cause,
                }),
        }
    }
}

fn advanced_breaker(options: &AdvancedBreakerOptions) -> CircuitBreakerConfig {
    CircuitBreakerConfig::advanced(
        options.failure_threshold,
        options.sampling_duration(),
        options.minimum_throughput,
        options.break_duration(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerKind, CircuitState};
    use meshguard_core::telemetry::names;
    use meshguard_testing::{RecordingMetrics, ScriptedCall};

    #[test]
    fn test_call_class_layers() {
        let options = ResiliencePolicyOptions::default();
        let metrics = RecordingMetrics::new().shared();

        assert_eq!(
            PolicyPipeline::standard("a", &options, Arc::clone(&metrics)).layers(),
            vec![PolicyLayer::CircuitBreaker, PolicyLayer::Retry, PolicyLayer::Timeout]
        );
        assert_eq!(
            PolicyPipeline::critical("a", &options, Arc::clone(&metrics)).layers(),
            vec![
                PolicyLayer::Bulkhead,
                PolicyLayer::CircuitBreaker,
                PolicyLayer::Retry,
                PolicyLayer::Timeout
            ]
        );
        assert_eq!(
            PolicyPipeline::grpc("a", &options, metrics).layers(),
            vec![PolicyLayer::CircuitBreaker, PolicyLayer::Retry]
        );
    }

    #[test]
    fn test_critical_uses_advanced_breaker_and_fewer_retries() {
        let options = ResiliencePolicyOptions::default();
        let pipeline = PolicyPipeline::critical("payments", &options, RecordingMetrics::new().shared());

        let breaker = pipeline.circuit_breaker().unwrap();
        assert!(matches!(breaker.config().kind, BreakerKind::Advanced { .. }));
        assert_eq!(pipeline.retry().unwrap().policy().max_retries, 2);
        assert_eq!(pipeline.timeout().unwrap().duration(), Duration::from_secs(15));
        assert_eq!(pipeline.bulkhead().unwrap().config(), BulkheadConfig::new(5, 10));
    }

    #[test]
    fn test_builder_order_does_not_matter() {
        let pipeline = PolicyPipeline::builder("a", RecordingMetrics::new().shared())
            .timeout(Duration::from_secs(1))
            .retry(RetryPolicy::with_retries(1))
            .bulkhead(BulkheadConfig::new(1, 0))
            .build();

        assert_eq!(
            pipeline.layers(),
            vec![PolicyLayer::Bulkhead, PolicyLayer::Retry, PolicyLayer::Timeout]
        );
    }

    #[test]
    fn test_service_overrides_are_applied() {
        let options = ResiliencePolicyOptions::from_toml_str(
            r#"
            [[services]]
            service_name = "inventory"
            retry_count = 1
            circuit_breaker_threshold = 2
            timeout_secs = 4
            enable_bulkhead = true
            "#,
        )
        .unwrap();
        let metrics = RecordingMetrics::new().shared();

        let inventory = PolicyPipeline::for_service("inventory", &options, Arc::clone(&metrics));
        assert_eq!(inventory.layers().first(), Some(&PolicyLayer::Bulkhead));
        assert_eq!(inventory.retry().unwrap().policy().max_retries, 1);
        assert_eq!(inventory.timeout().unwrap().duration(), Duration::from_secs(4));
        assert_eq!(
            inventory.circuit_breaker().unwrap().config().kind,
            BreakerKind::Simple {
                failure_threshold: 2
            }
        );

        let other = PolicyPipeline::for_service("catalog", &options, metrics);
        assert_eq!(other.layers().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_counts_one_failure_per_call_after_retries() {
        let options = ResiliencePolicyOptions::default();
        let metrics = RecordingMetrics::new();
        let pipeline = PolicyPipeline::standard("orders", &options, metrics.shared());
        let transport = ScriptedCall::always(CallError::transient("503"));

        for call in 1..=5 {
            let err = pipeline.execute(|ctx| transport.invoke(ctx)).await.unwrap_err();
            assert_eq!(err.layer, PolicyLayer::Retry);
            assert_eq!(err.attempts, 4);
            let expected = if call < 5 { CircuitState::Closed } else { CircuitState::Open };
            assert_eq!(pipeline.circuit_breaker().unwrap().state().await, expected);
        }
        assert_eq!(transport.calls(), 20);
        assert_eq!(metrics.count(names::RETRY_TOTAL), 15);

        let err = pipeline.execute(|ctx| transport.invoke(ctx)).await.unwrap_err();
        assert_eq!(err.layer, PolicyLayer::CircuitBreaker);
        assert_eq!(err.attempts, 0);
        assert!(err.is_rejection());
        assert_eq!(transport.calls(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_is_time_bounded() {
        let options = ResiliencePolicyOptions::default();
        let metrics = RecordingMetrics::new();
        let pipeline = PolicyPipeline::standard("orders", &options, metrics.shared());

        let result = pipeline
            .execute(|ctx| async move {
                if ctx.attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, CallError>(ctx.attempt)
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(metrics.count(names::TIMEOUT_TOTAL), 1);
        assert_eq!(metrics.count(names::RETRY_TOTAL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_toward_breaker() {
        let metrics = RecordingMetrics::new();
        let pipeline = PolicyPipeline::custom(
            "slow",
            CustomPolicy::new(0, 1, Duration::from_secs(1)),
            metrics.shared(),
        );

        let err = pipeline
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CallError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.layer, PolicyLayer::Timeout);
        assert_eq!(err.cause, CallError::TimeoutExceeded(Duration::from_secs(1)));
        assert_eq!(
            pipeline.circuit_breaker().unwrap().state().await,
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_non_transient_is_propagated_without_retry_or_breaker() {
        let options = ResiliencePolicyOptions::default();
        let pipeline = PolicyPipeline::standard("orders", &options, RecordingMetrics::new().shared());
        let transport = ScriptedCall::always(CallError::non_transient("404"));

        for _ in 0..10 {
            let err = pipeline.execute(|ctx| transport.invoke(ctx)).await.unwrap_err();
            assert_eq!(err.layer, PolicyLayer::Transport);
            assert_eq!(err.attempts, 1);
        }
        assert_eq!(transport.calls(), 10);
        assert_eq!(
            pipeline.circuit_breaker().unwrap().state().await,
            CircuitState::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_bulkhead_rejects_before_breaker() {
        let mut options = ResiliencePolicyOptions::default();
        options.critical.max_parallelization = 1;
        options.critical.max_queuing_actions = 0;
        let metrics = RecordingMetrics::new();
        let pipeline = PolicyPipeline::critical("payments", &options, metrics.shared());

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));
        let busy = pipeline.clone();
        let holder = tokio::spawn(async move {
            busy.execute(|_| {
                let gate = Arc::clone(&gate);
                async move {
                    if let Some(gate) = gate.lock().await.take() {
                        gate.await.ok();
                    }
                    Ok::<_, CallError>(())
                }
            })
            .await
        });

        while pipeline.bulkhead().unwrap().available_permits() > 0 {
            tokio::task::yield_now().await;
        }

        let err = pipeline
            .execute(|_| async { Ok::<_, CallError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.layer, PolicyLayer::Bulkhead);
        assert_eq!(err.attempts, 0);
        assert_eq!(pipeline.circuit_breaker().unwrap().stats().total_calls, 1);

        release.send(()).unwrap();
        assert!(holder.await.unwrap().is_ok());
        assert_eq!(metrics.count(names::BULKHEAD_REJECTION_TOTAL), 1);
    }

    #[tokio::test]
    async fn test_fallback_after_terminal_failure() {
        let metrics = RecordingMetrics::new();
        let pipeline = PolicyPipeline::builder("catalog", metrics.shared()).build();
        let fallback = Fallback::value("catalog", "cached", metrics.shared());

        let value = pipeline
            .execute_or_fallback(&fallback, |_| async {
                Err::<&str, _>(CallError::non_transient("500 body unreadable"))
            })
            .await;

        assert_eq!(value, "cached");
        assert_eq!(metrics.count(names::FALLBACK_TOTAL), 1);
    }
}
