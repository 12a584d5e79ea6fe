//! Per-attempt time bound.
//!
//! Cancellation is cooperative: on expiry the attempt future is dropped, so
//! it stops at its next `.await` and every outbound future it owns is dropped
//! with it. Nothing is forcibly killed.

use meshguard_core::error::CallError;
use meshguard_core::telemetry::{SharedMetrics, names, service_tag};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Timeout layer for one logical service.
#[derive(Clone)]
pub struct Timeout {
    service: Arc<str>,
    duration: Duration,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("service", &self.service)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

impl Timeout {
    /// Create a timeout layer.
    #[must_use]
    pub fn new(service: impl Into<Arc<str>>, duration: Duration, metrics: SharedMetrics) -> Self {
        Self {
            service: service.into(),
            duration,
            metrics,
        }
    }

    /// Configured bound.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Run one attempt within the bound.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::TimeoutExceeded`] on expiry, otherwise whatever
    /// the attempt returned.
    pub async fn execute<Fut, T>(&self, attempt: Fut) -> Result<T, CallError>
    where
        Fut: Future<Output = Result<T, CallError>>,
    {
        if let Ok(result) = tokio::time::timeout(self.duration, attempt).await {
            result
        } else {
            tracing::warn!(
                service = %self.service,
                timeout_secs = self.duration.as_secs_f64(),
                "Call attempt timed out"
            );
            self.metrics
                .increment(names::TIMEOUT_TOTAL, &[service_tag(&self.service)]);
            Err(CallError::TimeoutExceeded(self.duration))
        }
    }
}
