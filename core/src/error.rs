//! Failure taxonomy shared by every policy and transport adapter.
//!
//! Classification is a pure function of a [`CallError`] value. Transport
//! adapters map their own failures (HTTP status, client errors, RPC status
//! codes, broker errors) into it before a policy ever sees them.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single failed call attempt, or of a policy refusing to run it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Network failure, 5xx, 408, or equivalent. Retryable.
    #[error("Transient transport failure: {0}")]
    TransientTransport(String),

    /// The attempt did not finish within its time budget. Retryable and
    /// counted by the circuit breaker.
    #[error("Attempt timed out after {0:?}")]
    TimeoutExceeded(Duration),

    /// The circuit breaker refused the call without invoking the transport.
    #[error("Circuit breaker for '{service}' is open")]
    CircuitOpenRejected {
        /// Logical downstream service
        service: String,
    },

    /// The bulkhead had no execution slot and no queue slot left.
    #[error("Bulkhead for '{service}' rejected the call")]
    BulkheadRejected {
        /// Logical downstream service
        service: String,
    },

    /// Any failure retrying cannot fix (4xx other than 408, bad payload, ...).
    #[error("Non-transient failure: {0}")]
    NonTransient(String),
}

impl CallError {
    /// Build a [`CallError::TransientTransport`].
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientTransport(reason.into())
    }

    /// Build a [`CallError::NonTransient`].
    pub fn non_transient(reason: impl Into<String>) -> Self {
        Self::NonTransient(reason.into())
    }

    /// Whether the retry policy may try again after this failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTransport(_) | Self::TimeoutExceeded(_))
    }

    /// Whether a policy rejected the call before the transport ran.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpenRejected { .. } | Self::BulkheadRejected { .. }
        )
    }

    /// Whether the circuit breaker records this outcome as a failure.
    ///
    /// Rejections never count. Non-transient failures count only when
    /// `count_non_transient` is set.
    #[must_use]
    pub const fn counts_as_breaker_failure(&self, count_non_transient: bool) -> bool {
        match self {
            Self::TransientTransport(_) | Self::TimeoutExceeded(_) => true,
            Self::NonTransient(_) => count_non_transient,
            Self::CircuitOpenRejected { .. } | Self::BulkheadRejected { .. } => false,
        }
    }

    /// Classify an HTTP response status.
    ///
    /// 408 and every 5xx are transient failures. Anything else is a response
    /// the caller handles itself, so `None` is returned.
    #[must_use]
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            408 => Some(Self::transient("HTTP 408 Request Timeout")),
            500..=599 => Some(Self::transient(format!("HTTP {status}"))),
            _ => None,
        }
    }
}

/// Protective layer that produced a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyLayer {
    /// Load was shed before anything else ran
    Bulkhead,
    /// The breaker was open (or its probe slot taken)
    CircuitBreaker,
    /// Retries were exhausted on transient failures
    Retry,
    /// The single attempt timed out and no retry layer was configured
    Timeout,
    /// The transport failed with a non-retryable error
    Transport,
}

impl PolicyLayer {
    /// Lower-case label used in logs and metric tags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bulkhead => "bulkhead",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Retry => "retry",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for PolicyLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single terminal failure of a call that went through a policy pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Call to '{service}' failed at {layer} after {attempts} attempt(s): {cause}")]
pub struct ResilienceError {
    /// Logical downstream service
    pub service: String,
    /// Layer that ultimately gave up
    pub layer: PolicyLayer,
    /// Number of transport attempts made (0 when rejected up front)
    pub attempts: u32,
    /// Original failure
    #[source]
    pub cause: CallError,
}

impl ResilienceError {
    /// Whether the call was refused by the bulkhead or circuit breaker.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        self.cause.is_rejection()
    }
}

/// Misuse of the correlation context.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationError {
    /// Empty or whitespace-only correlation id
    #[error("Correlation id must not be empty or whitespace")]
    Invalid,
}
