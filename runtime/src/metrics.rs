//! Prometheus metrics for the resilience layers and transport adapters.
//!
//! Policies emit through the [`MetricsSink`] interface. [`PrometheusMetrics`]
//! forwards those emissions to the global `metrics` recorder, and
//! [`MetricsServer`] installs the Prometheus exporter behind it.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshguard_runtime::metrics::{MetricsServer, PrometheusMetrics};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! let sink = PrometheusMetrics::shared();
//! # Ok(())
//! # }
//! ```

use meshguard_core::telemetry::{MetricsSink, SharedMetrics, Tag, names};
use metrics::{Label, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server for `addr` (e.g. `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the resilience metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed. An
    /// already installed recorder is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_ms".to_string()),
                &[
                    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
                    30000.0,
                ],
            )
            .and_then(|builder| {
                builder.set_buckets_for_metric(
                    Matcher::Suffix("_seconds".to_string()),
                    &[0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 60.0],
                )
            })
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics exporter started - scrape at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the exporter is meant to be scraped on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(names::RETRY_TOTAL, "Retries performed, one per retry");
    describe_histogram!(
        names::RETRY_DELAY_SECONDS,
        "Delay slept before each retry"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_STATE_CHANGES,
        "Circuit breaker transitions by resulting state"
    );
    describe_counter!(names::TIMEOUT_TOTAL, "Attempts cancelled by the timeout layer");
    describe_counter!(
        names::BULKHEAD_REJECTION_TOTAL,
        "Calls rejected because the bulkhead was full"
    );
    describe_counter!(names::FALLBACK_TOTAL, "Fallback results returned");
    describe_histogram!(
        names::REQUEST_DURATION_MS,
        "Outbound call duration including every protective layer"
    );
}

/// [`MetricsSink`] that forwards to the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    /// Wrap in a [`SharedMetrics`] handle.
    #[must_use]
    pub fn shared() -> SharedMetrics {
        Arc::new(Self)
    }
}

fn labels(tags: &[Tag]) -> Vec<Label> {
    tags.iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, name: &'static str, tags: &[Tag]) {
        metrics::counter!(name, labels(tags)).increment(1);
    }

    fn record(&self, name: &'static str, value: f64, tags: &[Tag]) {
        metrics::histogram!(name, labels(tags)).record(value);
    }
}
