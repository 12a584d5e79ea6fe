//! Circuit breaker for preventing cascading failures.
//!
//! A circuit breaker watches the outcomes of calls to one downstream service
//! and "opens" (stops admitting calls) when they fail too often.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Outcomes are recorded.
//! - **Open**: Calls are rejected without running for the break duration.
//! - **HalfOpen**: Exactly one probe call is admitted. Success closes the
//!   circuit, failure re-opens it and restarts the break duration.
//!
//! # Variants
//!
//! - **Simple**: opens after `failure_threshold` consecutive failures.
//! - **Advanced**: opens when the failure ratio over a rolling sampling window
//!   reaches `failure_ratio`, once the window has seen `minimum_throughput` calls.
//!
//! Every transition is serialized under one lock, logged, and counted on
//! `resilience_circuit_breaker_state_changes{service, state, type}`.
//!
//! # Example
//!
//! ```rust
//! use meshguard_core::{CallError, NoopMetrics};
//! use meshguard_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .break_duration(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("orders", config, NoopMetrics::shared());
//!
//! match breaker.execute(|| async { Ok::<_, CallError>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use crate::failure::PolicyFailure;
use meshguard_core::error::{CallError, PolicyLayer};
use meshguard_core::telemetry::{SharedMetrics, names, service_tag, tags};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Buckets the advanced variant splits its sampling window into.
const WINDOW_BUCKETS: u32 = 10;

/// How the breaker decides to open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakerKind {
    /// Consecutive-failure counter
    Simple {
        /// Consecutive failures that open the circuit
        failure_threshold: u32,
    },
    /// Failure ratio over a rolling window
    Advanced {
        /// Ratio in `(0, 1]` at or above which the circuit opens
        failure_ratio: f64,
        /// Length of the rolling window
        sampling_duration: Duration,
        /// Calls the window must hold before the ratio counts
        minimum_throughput: u32,
    },
}

impl BreakerKind {
    /// Metric/log label: `simple` or `advanced`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Advanced { .. } => "advanced",
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Opening rule
    pub kind: BreakerKind,
    /// Time spent Open before the probe is admitted
    pub break_duration: Duration,
    /// Record non-transient failures as breaker failures
    pub count_non_transient: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            kind: BreakerKind::Simple {
                failure_threshold: 5,
            },
            break_duration: Duration::from_secs(30),
            count_non_transient: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            kind: None,
            break_duration: None,
            count_non_transient: false,
        }
    }

    /// Simple breaker opening after `failure_threshold` consecutive failures.
    #[must_use]
    pub const fn simple(failure_threshold: u32, break_duration: Duration) -> Self {
        Self {
            kind: BreakerKind::Simple { failure_threshold },
            break_duration,
            count_non_transient: false,
        }
    }

    /// Advanced breaker opening on a failure ratio.
    #[must_use]
    pub const fn advanced(
        failure_ratio: f64,
        sampling_duration: Duration,
        minimum_throughput: u32,
        break_duration: Duration,
    ) -> Self {
        Self {
            kind: BreakerKind::Advanced {
                failure_ratio,
                sampling_duration,
                minimum_throughput,
            },
            break_duration,
            count_non_transient: false,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    kind: Option<BreakerKind>,
    break_duration: Option<Duration>,
    count_non_transient: bool,
}

impl CircuitBreakerConfigBuilder {
    /// Use the simple variant with this threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.kind = Some(BreakerKind::Simple {
            failure_threshold: threshold,
        });
        self
    }

    /// Use the advanced variant.
    #[must_use]
    pub const fn failure_ratio(
        mut self,
        ratio: f64,
        sampling_duration: Duration,
        minimum_throughput: u32,
    ) -> Self {
        self.kind = Some(BreakerKind::Advanced {
            failure_ratio: ratio,
            sampling_duration,
            minimum_throughput,
        });
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn break_duration(mut self, duration: Duration) -> Self {
        self.break_duration = Some(duration);
        self
    }

    /// Count non-transient failures too.
    #[must_use]
    pub const fn count_non_transient(mut self, enabled: bool) -> Self {
        self.count_non_transient = enabled;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            kind: self.kind.unwrap_or(defaults.kind),
            break_duration: self.break_duration.unwrap_or(defaults.break_duration),
            count_non_transient: self.count_non_transient,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected
    Open,
    /// One probe call is admitted
    HalfOpen,
}

impl CircuitState {
    /// Metric/log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    successes: u32,
    failures: u32,
}

/// Rolling window of outcomes, split into fixed-width buckets.
#[derive(Debug)]
struct RollingWindow {
    span: Duration,
    bucket_width: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn new(span: Duration) -> Self {
        let bucket_width = (span / WINDOW_BUCKETS).max(Duration::from_millis(1));
        Self {
            span,
            bucket_width,
            buckets: VecDeque::with_capacity(WINDOW_BUCKETS as usize + 1),
        }
    }

    fn record(&mut self, now: Instant, failed: bool) {
        self.evict(now);
        let needs_bucket = self
            .buckets
            .back()
            .is_none_or(|bucket| now.duration_since(bucket.started) >= self.bucket_width);
        if needs_bucket {
            self.buckets.push_back(Bucket {
                started: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if failed {
                bucket.failures += 1;
            } else {
                bucket.successes += 1;
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        while self
            .buckets
            .front()
            .is_some_and(|bucket| now.duration_since(bucket.started) >= self.span)
        {
            self.buckets.pop_front();
        }
    }

    /// `(total, failures)` in the window.
    fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.evict(now);
        self.buckets.iter().fold((0, 0), |(total, failures), bucket| {
            (
                total + bucket.successes + bucket.failures,
                failures + bucket.failures,
            )
        })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    window: RollingWindow,
    opened_at: Option<Instant>,
    /// Bumped on every transition and reset; a probe only reports into the
    /// generation that admitted it.
    generation: u64,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe { generation: u64 },
}

/// Outcome as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    Ignored,
}

/// Releases the HalfOpen probe slot if the probe is dropped before reporting.
struct ProbeSlot {
    in_flight: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.store(false, Ordering::Release);
        }
    }
}

/// Call statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

/// Circuit breaker shared by all calls to one logical downstream service.
///
/// Cloning shares the state.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<BreakerState>>,
    probe_in_flight: Arc<AtomicBool>,
    metrics: SharedMetrics,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker, Closed.
    #[must_use]
    pub fn new(
        service: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
        metrics: SharedMetrics,
    ) -> Self {
        let span = match config.kind {
            BreakerKind::Advanced {
                sampling_duration, ..
            } => sampling_duration,
            BreakerKind::Simple { .. } => Duration::ZERO,
        };
        Self {
            service: service.into(),
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: RollingWindow::new(span),
                opened_at: None,
                generation: 0,
            })),
            probe_in_flight: Arc::new(AtomicBool::new(false)),
            metrics,
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An expired Open state is reported as Open until the
    /// next call promotes it.
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Run `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns a circuit-open rejection (built through [`PolicyFailure`]) if
    /// the call is not admitted, otherwise whatever `operation` returned.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: PolicyFailure,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.admit().await else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(service = %self.service, "Circuit breaker is open, rejecting call");
            return Err(E::rejected(
                &self.service,
                PolicyLayer::CircuitBreaker,
                CallError::CircuitOpenRejected {
                    service: self.service.to_string(),
                },
            ));
        };

        let mut probe = ProbeSlot {
            in_flight: Arc::clone(&self.probe_in_flight),
            armed: matches!(admission, Admission::Probe { .. }),
        };

        let result = operation().await;

        let verdict = match &result {
            Ok(_) => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Verdict::Success
            }
            Err(err)
                if err
                    .call_error()
                    .counts_as_breaker_failure(self.config.count_non_transient) =>
            {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Verdict::Failure
            }
            Err(_) => Verdict::Ignored,
        };

        self.record(admission, verdict).await;
        probe.armed = false;
        result
    }

    /// Force the breaker back to Closed.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!(service = %self.service, "Circuit breaker manually reset");
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        state.consecutive_failures = 0;
        state.window.clear();
        state.generation += 1;
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Call statistics.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Decide whether a call may run.
    async fn admit(&self) -> Option<Admission> {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let expired = state
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.config.break_duration);
                if !expired {
                    return None;
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                self.claim_probe(state.generation)
            }
            CircuitState::HalfOpen => self.claim_probe(state.generation),
        }
    }

    fn claim_probe(&self, generation: u64) -> Option<Admission> {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Admission::Probe { generation })
    }

    async fn record(&self, admission: Admission, verdict: Verdict) {
        let mut state = self.state.write().await;
        let now = Instant::now();

        if let Admission::Probe { generation } = admission {
            // The breaker was reset while the probe ran; its slot is already gone.
            if generation != state.generation {
                return;
            }
            match verdict {
                Verdict::Success => {
                    state.consecutive_failures = 0;
                    state.window.clear();
                    self.transition(&mut state, CircuitState::Closed);
                }
                Verdict::Failure => {
                    state.opened_at = Some(now);
                    self.transition(&mut state, CircuitState::Open);
                }
                Verdict::Ignored => {}
            }
            self.probe_in_flight.store(false, Ordering::Release);
            return;
        }

        // A concurrent call already opened the circuit; late outcomes don't move it.
        if state.state != CircuitState::Closed {
            return;
        }

        match verdict {
            Verdict::Success => {
                state.consecutive_failures = 0;
                state.window.record(now, false);
            }
            Verdict::Failure => {
                state.consecutive_failures += 1;
                state.window.record(now, true);
                if self.should_open(&mut state, now) {
                    state.opened_at = Some(now);
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            Verdict::Ignored => {}
        }
    }

    fn should_open(&self, state: &mut BreakerState, now: Instant) -> bool {
        match self.config.kind {
            BreakerKind::Simple { failure_threshold } => {
                state.consecutive_failures >= failure_threshold
            }
            BreakerKind::Advanced {
                failure_ratio,
                minimum_throughput,
                ..
            } => {
                let (total, failures) = state.window.totals(now);
                total >= minimum_throughput
                    && f64::from(failures) / f64::from(total) >= failure_ratio
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.generation += 1;

        match to {
            CircuitState::Open => tracing::error!(
                service = %self.service,
                breaker_type = self.config.kind.as_str(),
                from = %from,
                break_secs = self.config.break_duration.as_secs_f64(),
                "Circuit breaker opened"
            ),
            CircuitState::Closed => tracing::info!(
                service = %self.service,
                breaker_type = self.config.kind.as_str(),
                from = %from,
                "Circuit breaker reset"
            ),
            CircuitState::HalfOpen => tracing::info!(
                service = %self.service,
                breaker_type = self.config.kind.as_str(),
                "Circuit breaker half-open, admitting probe"
            ),
        }

        self.metrics.increment(
            names::CIRCUIT_BREAKER_STATE_CHANGES,
            &[
                service_tag(&self.service),
                (tags::STATE, to.as_str().to_string()),
                (tags::TYPE, self.config.kind.as_str().to_string()),
            ],
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use meshguard_testing::RecordingMetrics;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: u32, metrics: &RecordingMetrics) -> CircuitBreaker {
        CircuitBreaker::new(
            "orders",
            CircuitBreakerConfig::simple(threshold, Duration::from_secs(30)),
            metrics.shared(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CallError> {
        breaker
            .execute(|| async { Err::<(), _>(CallError::transient("503")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CallError> {
        breaker.execute(|| async { Ok::<_, CallError>(()) }).await
    }

    #[tokio::test]
    async fn test_closed_on_success() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(5, &metrics);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(5, &metrics);

        for _ in 0..5 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CallError>(())
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            CallError::CircuitOpenRejected {
                service: "orders".into()
            }
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let changes = metrics.events(names::CIRCUIT_BREAKER_STATE_CHANGES);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].tag("state"), Some("open"));
        assert_eq!(changes[0].tag("type"), Some("simple"));
        assert_eq!(changes[0].tag("service"), Some("orders"));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(3, &metrics);

        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.ok();
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();

        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_transient_failures_are_not_counted() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(2, &metrics);

        for _ in 0..5 {
            breaker
                .execute(|| async { Err::<(), _>(CallError::non_transient("404")) })
                .await
                .ok();
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_transient_counted_when_enabled() {
        let metrics = RecordingMetrics::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .count_non_transient(true)
            .build();
        let breaker = CircuitBreaker::new("orders", config, metrics.shared());

        for _ in 0..2 {
            breaker
                .execute(|| async { Err::<(), _>(CallError::non_transient("422")) })
                .await
                .ok();
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(5, &metrics);
        for _ in 0..5 {
            fail(&breaker).await.ok();
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&breaker).await.is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());

        let states: Vec<String> = metrics
            .events(names::CIRCUIT_BREAKER_STATE_CHANGES)
            .iter()
            .filter_map(|event| event.tag("state").map(str::to_string))
            .collect();
        assert_eq!(states, vec!["open", "half_open", "closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_restarts_cooldown() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(5, &metrics);
        for _ in 0..5 {
            fail(&breaker).await.ok();
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            fail(&breaker).await.unwrap_err(),
            CallError::transient("503")
        );
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(CallError::CircuitOpenRejected { .. })
        ));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(1, &metrics);
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let probe_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| async move {
                    gate.await.ok();
                    Ok::<_, CallError>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        while breaker.state().await != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            succeed(&breaker).await,
            Err(CallError::CircuitOpenRejected { .. })
        ));

        release.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(1, &metrics);
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(31)).await;

        let dropped = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, CallError>(())
            }),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_finishing_after_reset_does_not_reopen() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(5, &metrics);
        for _ in 0..5 {
            fail(&breaker).await.ok();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let (started_tx, started) = tokio::sync::oneshot::channel::<()>();
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        started_tx.send(()).ok();
                        gate.await.ok();
                        Err::<(), _>(CallError::transient("503"))
                    })
                    .await
            })
        };
        started.await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        release.send(()).unwrap();
        assert!(probe.await.unwrap().is_err());
        assert_eq!(breaker.state().await, CircuitState::Closed);

        // Still needs the full threshold of fresh failures.
        for _ in 0..4 {
            fail(&breaker).await.ok();
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        fail(&breaker).await.ok();
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(3, &metrics);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move { fail(&breaker).await }));
        }
        for handle in handles {
            handle.await.ok();
        }

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(metrics.count(names::CIRCUIT_BREAKER_STATE_CHANGES), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advanced_needs_minimum_throughput() {
        let metrics = RecordingMetrics::new();
        let breaker = CircuitBreaker::new(
            "payments",
            CircuitBreakerConfig::advanced(0.5, Duration::from_secs(10), 8, Duration::from_secs(30)),
            metrics.shared(),
        );

        for _ in 0..7 {
            fail(&breaker).await.ok();
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        fail(&breaker).await.ok();
        assert_eq!(breaker.state().await, CircuitState::Open);
        let changes = metrics.events(names::CIRCUIT_BREAKER_STATE_CHANGES);
        assert_eq!(changes[0].tag("type"), Some("advanced"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advanced_opens_at_ratio() {
        let metrics = RecordingMetrics::new();
        let breaker = CircuitBreaker::new(
            "payments",
            CircuitBreakerConfig::advanced(0.5, Duration::from_secs(10), 8, Duration::from_secs(30)),
            metrics.shared(),
        );

        for _ in 0..4 {
            succeed(&breaker).await.ok();
        }
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        // 4 failures out of 8 reaches 0.5
        fail(&breaker).await.ok();
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advanced_window_forgets_old_outcomes() {
        let metrics = RecordingMetrics::new();
        let breaker = CircuitBreaker::new(
            "payments",
            CircuitBreakerConfig::advanced(0.5, Duration::from_secs(10), 8, Duration::from_secs(30)),
            metrics.shared(),
        );

        for _ in 0..7 {
            fail(&breaker).await.ok();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        fail(&breaker).await.ok();
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let metrics = RecordingMetrics::new();
        let breaker = breaker(2, &metrics);

        for _ in 0..3 {
            succeed(&breaker).await.ok();
        }
        for _ in 0..2 {
            fail(&breaker).await.ok();
        }
        fail(&breaker).await.ok();

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 6);
        assert_eq!(stats.total_successes, 3);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.total_rejections, 1);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }
}
