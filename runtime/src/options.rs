//! Resilience configuration bound once at client construction.
//!
//! Options are read from TOML, validated, and then handed to the pipeline
//! constructors. Nothing re-reads them per call.
//!
//! # Example
//!
//! ```rust
//! use meshguard_runtime::options::ResiliencePolicyOptions;
//!
//! let options = ResiliencePolicyOptions::from_toml_str(r#"
//!     [http]
//!     retry_count = 5
//!
//!     [[services]]
//!     service_name = "payments"
//!     enable_bulkhead = true
//!     use_advanced_circuit_breaker = true
//! "#).unwrap();
//!
//! assert_eq!(options.http.retry_count, 5);
//! assert_eq!(options.http.timeout_secs, 10);
//! assert!(options.service("payments").is_some());
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a TOML file with [`ResiliencePolicyOptions`].
pub const CONFIG_PATH_ENV: &str = "MESHGUARD_RESILIENCE_CONFIG";

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration from {path}: {source}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Settings for standard HTTP calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientOptions {
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Consecutive failures that open the simple breaker
    pub circuit_breaker_threshold: u32,
    /// How long the breaker stays open, in seconds
    pub circuit_breaker_duration_secs: u64,
    /// Per-attempt timeout, in seconds
    pub timeout_secs: u64,
    /// Bulkhead execution slots (used by per-service overrides)
    pub max_parallelization: usize,
    /// Bulkhead queue slots (used by per-service overrides)
    pub max_queuing_actions: usize,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            retry_count: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_duration_secs: 30,
            timeout_secs: 10,
            max_parallelization: 10,
            max_queuing_actions: 20,
        }
    }
}

impl HttpClientOptions {
    /// Breaker open duration.
    #[must_use]
    pub const fn circuit_breaker_duration(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_duration_secs)
    }

    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate HTTP options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker_threshold == 0 {
            return Err(invalid("http.circuit_breaker_threshold must be > 0"));
        }
        if self.circuit_breaker_duration_secs == 0 {
            return Err(invalid("http.circuit_breaker_duration_secs must be > 0"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("http.timeout_secs must be > 0"));
        }
        if self.max_parallelization == 0 {
            return Err(invalid("http.max_parallelization must be > 0"));
        }
        Ok(())
    }
}

/// Settings for the failure-ratio breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedBreakerOptions {
    /// Failure ratio in `(0, 1]` that opens the breaker
    pub failure_threshold: f64,
    /// Rolling sampling window, in seconds
    pub sampling_duration_secs: u64,
    /// Calls the window must have seen before the ratio is considered
    pub minimum_throughput: u32,
    /// How long the breaker stays open, in seconds
    pub break_duration_secs: u64,
}

impl Default for AdvancedBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            sampling_duration_secs: 10,
            minimum_throughput: 8,
            break_duration_secs: 30,
        }
    }
}

impl AdvancedBreakerOptions {
    /// Sampling window.
    #[must_use]
    pub const fn sampling_duration(&self) -> Duration {
        Duration::from_secs(self.sampling_duration_secs)
    }

    /// Breaker open duration.
    #[must_use]
    pub const fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_duration_secs)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(invalid(&format!(
                "{section}.failure_threshold must be in (0, 1], got {}",
                self.failure_threshold
            )));
        }
        if self.sampling_duration_secs == 0 {
            return Err(invalid(&format!("{section}.sampling_duration_secs must be > 0")));
        }
        if self.minimum_throughput == 0 {
            return Err(invalid(&format!("{section}.minimum_throughput must be > 0")));
        }
        if self.break_duration_secs == 0 {
            return Err(invalid(&format!("{section}.break_duration_secs must be > 0")));
        }
        Ok(())
    }
}

/// Settings for RPC calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcClientOptions {
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Per-call deadline handed to the channel, in seconds
    pub timeout_secs: u64,
    /// Failure-ratio breaker
    #[serde(flatten)]
    pub breaker: AdvancedBreakerOptions,
}

impl Default for GrpcClientOptions {
    fn default() -> Self {
        Self {
            retry_count: 3,
            timeout_secs: 15,
            breaker: AdvancedBreakerOptions::default(),
        }
    }
}

impl GrpcClientOptions {
    /// Per-call deadline.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for critical calls (payments, order creation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticalCallOptions {
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Per-attempt timeout, in seconds
    pub timeout_secs: u64,
    /// Bulkhead execution slots
    pub max_parallelization: usize,
    /// Bulkhead queue slots
    pub max_queuing_actions: usize,
    /// Failure-ratio breaker
    #[serde(flatten)]
    pub breaker: AdvancedBreakerOptions,
}

impl Default for CriticalCallOptions {
    fn default() -> Self {
        Self {
            retry_count: 2,
            timeout_secs: 15,
            max_parallelization: 5,
            max_queuing_actions: 10,
            breaker: AdvancedBreakerOptions::default(),
        }
    }
}

impl CriticalCallOptions {
    /// Per-attempt timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-service overrides on top of the HTTP defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResilienceOptions {
    /// Logical service the override applies to
    pub service_name: String,
    /// Retry count override
    #[serde(default)]
    pub retry_count: Option<u32>,
    /// Simple breaker threshold override
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,
    /// Per-attempt timeout override, in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Put a bulkhead in front of this service
    #[serde(default)]
    pub enable_bulkhead: bool,
    /// Use the failure-ratio breaker instead of the consecutive-failure one
    #[serde(default)]
    pub use_advanced_circuit_breaker: bool,
}

impl ServiceResilienceOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(invalid("services[].service_name cannot be empty"));
        }
        if self.circuit_breaker_threshold == Some(0) {
            return Err(invalid(&format!(
                "services[{}].circuit_breaker_threshold must be > 0",
                self.service_name
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(invalid(&format!(
                "services[{}].timeout_secs must be > 0",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// Complete resilience configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResiliencePolicyOptions {
    /// Standard HTTP calls
    pub http: HttpClientOptions,
    /// RPC calls
    pub grpc: GrpcClientOptions,
    /// Critical calls
    pub critical: CriticalCallOptions,
    /// Per-service overrides
    pub services: Vec<ServiceResilienceOptions>,
}

impl ResiliencePolicyOptions {
    /// Parse and validate TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Validation`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from the file named by [`CONFIG_PATH_ENV`], or defaults when unset.
    ///
    /// # Errors
    ///
    /// As [`Self::load`].
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.validate()?;
        self.grpc.breaker.validate("grpc")?;
        if self.grpc.timeout_secs == 0 {
            return Err(invalid("grpc.timeout_secs must be > 0"));
        }
        self.critical.breaker.validate("critical")?;
        if self.critical.timeout_secs == 0 {
            return Err(invalid("critical.timeout_secs must be > 0"));
        }
        if self.critical.max_parallelization == 0 {
            return Err(invalid("critical.max_parallelization must be > 0"));
        }
        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }

    /// Override for `service_name`, if configured.
    #[must_use]
    pub fn service(&self, service_name: &str) -> Option<&ServiceResilienceOptions> {
        self.services
            .iter()
            .find(|service| service.service_name == service_name)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}
