//! Retry with exponential backoff and jitter for transient failures.
//!
//! Only [`CallError::TransientTransport`] and [`CallError::TimeoutExceeded`]
//! are retried. Rejections and non-transient failures end the loop at once.
//! Attempts of one call are strictly sequential.
//!
//! # Example
//!
//! ```rust
//! use meshguard_core::{CallError, NoopMetrics};
//! use meshguard_runtime::retry::{Retry, RetryPolicy};
//!
//! # async fn example() {
//! let retry = Retry::new("inventory", RetryPolicy::default(), NoopMetrics::shared());
//!
//! let result = retry
//!     .execute(|ctx| async move {
//!         // ctx.attempt starts at 1
//!         Ok::<_, CallError>(ctx.attempt)
//!     })
//!     .await;
//!
//! assert_eq!(result.unwrap(), 1);
//! # }
//! ```

use crate::failure::layer_for;
use meshguard_core::error::{CallError, ResilienceError};
use meshguard_core::telemetry::{SharedMetrics, names, service_tag, tags};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff configuration.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `base_delay`: 1 second (retries wait 2 s, 4 s, 8 s before jitter)
/// - `multiplier`: 2.0
/// - `max_delay`: 60 seconds
/// - `max_jitter`: 1000 ms
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay unit multiplied by `multiplier ^ attempt`
    pub base_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Cap on the exponential part of the delay
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the uniform jitter added to every delay
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            base_delay: None,
            multiplier: None,
            max_delay: None,
            max_jitter: None,
        }
    }

    /// Policy with the default backoff and `max_retries` retries.
    #[must_use]
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Exponential part of the delay before retry number `attempt` (1-based).
    ///
    /// `base_delay * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Full delay before retry number `attempt`: backoff plus uniform jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_for_attempt(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_nanos = u64::try_from(self.max_jitter.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..max_nanos))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    base_delay: Option<Duration>,
    multiplier: Option<f64>,
    max_delay: Option<Duration>,
    max_jitter: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the delay unit.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the jitter bound. `Duration::ZERO` disables jitter.
    #[must_use]
    pub const fn max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            max_jitter: self.max_jitter.unwrap_or(defaults.max_jitter),
        }
    }
}

/// Per-attempt view of a call, handed to the operation on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttemptContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// Total time slept between attempts so far
    pub elapsed_delay: Duration,
    /// Logical downstream service
    pub service: Arc<str>,
}

impl RetryAttemptContext {
    /// Context of the first attempt.
    #[must_use]
    pub const fn first(service: Arc<str>) -> Self {
        Self {
            attempt: 1,
            elapsed_delay: Duration::ZERO,
            service,
        }
    }

    /// Whether this attempt is a retry.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// Retry layer for one logical service.
#[derive(Clone)]
pub struct Retry {
    service: Arc<str>,
    policy: RetryPolicy,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("service", &self.service)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Retry {
    /// Create a retry layer.
    #[must_use]
    pub fn new(service: impl Into<Arc<str>>, policy: RetryPolicy, metrics: SharedMetrics) -> Self {
        Self {
            service: service.into(),
            policy,
            metrics,
        }
    }

    /// The backoff policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails non-transiently, or retries run out.
    ///
    /// # Errors
    ///
    /// Returns a [`ResilienceError`] carrying the last failure and the number
    /// of attempts made. Exhausted transient failures are attributed to the
    /// retry layer.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut(RetryAttemptContext) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut context = RetryAttemptContext::first(Arc::clone(&self.service));

        loop {
            let attempt = context.attempt;
            match operation(context.clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            service = %self.service,
                            attempt,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => {
                    return Err(self.give_up(err, attempt, false));
                }
                Err(err) if attempt > self.policy.max_retries => {
                    tracing::error!(
                        service = %self.service,
                        attempts = attempt,
                        error = %err,
                        "Call failed after max retries"
                    );
                    return Err(self.give_up(err, attempt, self.policy.max_retries > 0));
                }
                Err(err) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    self.on_retry(attempt, delay, &err);
                    sleep(delay).await;
                    context.attempt += 1;
                    context.elapsed_delay += delay;
                }
            }
        }
    }

    fn on_retry(&self, attempt: u32, delay: Duration, err: &CallError) {
        tracing::warn!(
            service = %self.service,
            attempt,
            max_retries = self.policy.max_retries,
            delay_secs = delay.as_secs_f64(),
            reason = %err,
            "Retrying call"
        );
        self.metrics.increment(
            names::RETRY_TOTAL,
            &[
                service_tag(&self.service),
                (tags::ATTEMPT, attempt.to_string()),
            ],
        );
        self.metrics.record(
            names::RETRY_DELAY_SECONDS,
            delay.as_secs_f64(),
            &[service_tag(&self.service)],
        );
    }

    fn give_up(&self, cause: CallError, attempts: u32, retried: bool) -> ResilienceError {
        ResilienceError {
            service: self.service.to_string(),
            layer: layer_for(&cause, retried),
            attempts,
            cause,
        }
    }
}
