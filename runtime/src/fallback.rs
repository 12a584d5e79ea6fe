//! Substitute result for calls every other layer gave up on.

use meshguard_core::error::ResilienceError;
use meshguard_core::telemetry::{SharedMetrics, names, service_tag};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type FallbackFn<T> = Arc<dyn Fn(&ResilienceError) -> T + Send + Sync>;

/// Fallback for one logical service and result type.
pub struct Fallback<T> {
    service: Arc<str>,
    substitute: FallbackFn<T>,
    metrics: SharedMetrics,
}

impl<T> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            substitute: Arc::clone(&self.substitute),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Fallback<T> {
    /// Always substitute `value`.
    #[must_use]
    pub fn value(service: impl Into<Arc<str>>, value: T, metrics: SharedMetrics) -> Self {
        Self::from_fn(service, move |_| value.clone(), metrics)
    }
}

impl<T> Fallback<T> {
    /// Compute the substitute from the terminal failure.
    #[must_use]
    pub fn from_fn<F>(service: impl Into<Arc<str>>, substitute: F, metrics: SharedMetrics) -> Self
    where
        F: Fn(&ResilienceError) -> T + Send + Sync + 'static,
    {
        Self {
            service: service.into(),
            substitute: Arc::new(substitute),
            metrics,
        }
    }

    /// Pass a success through, replace a failure.
    pub fn apply(&self, result: Result<T, ResilienceError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    service = %self.service,
                    layer = %err.layer,
                    attempts = err.attempts,
                    reason = %err.cause,
                    "Returning fallback result"
                );
                self.metrics
                    .increment(names::FALLBACK_TOTAL, &[service_tag(&self.service)]);
                (self.substitute)(&err)
            }
        }
    }

    /// Await `call` and apply the fallback to its result.
    pub async fn execute<Fut>(&self, call: Fut) -> T
    where
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.apply(call.await)
    }
}
