//! # Meshguard Runtime
//!
//! Protective layers for outbound calls and their composition.
//!
//! ## Components
//!
//! - **Retry**: exponential backoff with jitter, transient failures only
//! - **Circuit breaker**: simple (consecutive failures) or advanced (failure ratio)
//! - **Timeout**: per-attempt bound with cooperative cancellation
//! - **Bulkhead**: concurrency cap with a bounded wait queue
//! - **Fallback**: substitute result for terminal failures
//! - **Pipeline**: fixed-order composition per call class
//! - **Options**: TOML configuration with validated defaults
//! - **Metrics**: Prometheus exporter and sink
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshguard_core::CallError;
//! use meshguard_runtime::metrics::PrometheusMetrics;
//! use meshguard_runtime::options::ResiliencePolicyOptions;
//! use meshguard_runtime::pipeline::PolicyPipeline;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ResiliencePolicyOptions::from_env()?;
//! let payments = PolicyPipeline::critical("payments", &options, PrometheusMetrics::shared());
//!
//! let receipt = payments
//!     .execute(|_ctx| async { Ok::<_, CallError>("receipt-17") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod failure;
pub mod fallback;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig};
pub use circuit_breaker::{
    BreakerKind, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use failure::PolicyFailure;
pub use fallback::Fallback;
pub use options::{ConfigError, ResiliencePolicyOptions};
pub use pipeline::{CustomPolicy, PipelineBuilder, PolicyPipeline};
pub use retry::{Retry, RetryAttemptContext, RetryPolicy};
pub use timeout::Timeout;
