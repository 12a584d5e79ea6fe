//! Metrics producer interface used by every policy and adapter.
//!
//! Sinks are constructed once at startup and injected as [`SharedMetrics`].
//! `meshguard-runtime` provides a Prometheus-backed sink; tests use the
//! recording sink from `meshguard-testing`.

use std::sync::Arc;

/// Metric names emitted by the policies and transport adapters.
pub mod names {
    /// Counter, one per retry (tags: service, attempt)
    pub const RETRY_TOTAL: &str = "resilience_retry_total";
    /// Histogram of the delay before each retry, in seconds (tags: service)
    pub const RETRY_DELAY_SECONDS: &str = "resilience_retry_delay_seconds";
    /// Counter, one per breaker transition (tags: service, state, type)
    pub const CIRCUIT_BREAKER_STATE_CHANGES: &str = "resilience_circuit_breaker_state_changes";
    /// Counter, one per timed-out attempt (tags: service)
    pub const TIMEOUT_TOTAL: &str = "resilience_timeout_total";
    /// Counter, one per bulkhead rejection (tags: service)
    pub const BULKHEAD_REJECTION_TOTAL: &str = "resilience_bulkhead_rejection_total";
    /// Counter, one per fallback substitution (tags: service)
    pub const FALLBACK_TOTAL: &str = "resilience_fallback_total";
    /// Histogram of whole outbound call duration in milliseconds (tags: service, success, protocol)
    pub const REQUEST_DURATION_MS: &str = "resilience_http_request_duration_ms";
}

/// Tag keys used consistently across metrics.
pub mod tags {
    /// Logical downstream service
    pub const SERVICE: &str = "service";
    /// Breaker state after a transition (`open`, `closed`, `half_open`)
    pub const STATE: &str = "state";
    /// Breaker variant (`simple`, `advanced`)
    pub const TYPE: &str = "type";
    /// Whether the call succeeded (`true`, `false`)
    pub const SUCCESS: &str = "success";
    /// 1-based retry number
    pub const ATTEMPT: &str = "attempt";
    /// Transport (`http`, `grpc`, `messaging`)
    pub const PROTOCOL: &str = "protocol";
}

/// A metric tag: static key, owned value.
pub type Tag = (&'static str, String);

/// Narrow producer interface for counters and histograms.
pub trait MetricsSink: Send + Sync {
    /// Add one to the counter `name`.
    fn increment(&self, name: &'static str, tags: &[Tag]);

    /// Record `value` into the histogram `name`.
    fn record(&self, name: &'static str, value: f64, tags: &[Tag]);
}

/// Shared, injectable sink handle.
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl NoopMetrics {
    /// Wrap in a [`SharedMetrics`] handle.
    #[must_use]
    pub fn shared() -> SharedMetrics {
        Arc::new(Self)
    }
}

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _tags: &[Tag]) {}

    fn record(&self, _name: &'static str, _value: f64, _tags: &[Tag]) {}
}

/// The `service` tag.
#[must_use]
pub fn service_tag(service: &str) -> Tag {
    (tags::SERVICE, service.to_string())
}
