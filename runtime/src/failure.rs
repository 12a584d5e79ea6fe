//! Bridge between the primitives and the error type a caller works with.
//!
//! The circuit breaker and bulkhead are usable on their own (failing with a
//! bare [`CallError`]) and inside a pipeline (failing with a
//! [`ResilienceError`]). Both error types implement [`PolicyFailure`] so the
//! primitives can classify an outcome and build a rejection of the right type.

use meshguard_core::error::{CallError, PolicyLayer, ResilienceError};

/// Error type a protective layer can classify and produce.
pub trait PolicyFailure: Sized {
    /// Underlying call failure.
    fn call_error(&self) -> &CallError;

    /// Build a failure for a call refused by `layer` before any attempt ran.
    fn rejected(service: &str, layer: PolicyLayer, cause: CallError) -> Self;
}

impl PolicyFailure for CallError {
    fn call_error(&self) -> &CallError {
        self
    }

    fn rejected(_service: &str, _layer: PolicyLayer, cause: CallError) -> Self {
        cause
    }
}

impl PolicyFailure for ResilienceError {
    fn call_error(&self) -> &CallError {
        &self.cause
    }

    fn rejected(service: &str, layer: PolicyLayer, cause: CallError) -> Self {
        Self {
            service: service.to_string(),
            layer,
            attempts: 0,
            cause,
        }
    }
}

/// Layer to blame for `cause` when it escapes the attempt loop.
///
/// `retried` is set when a retry layer ran out of attempts on a transient failure.
pub(crate) const fn layer_for(cause: &CallError, retried: bool) -> PolicyLayer {
    match cause {
        CallError::CircuitOpenRejected { .. } => PolicyLayer::CircuitBreaker,
        CallError::BulkheadRejected { .. } => PolicyLayer::Bulkhead,
        CallError::TransientTransport(_) | CallError::TimeoutExceeded(_) if retried => {
            PolicyLayer::Retry
        }
        CallError::TimeoutExceeded(_) => PolicyLayer::Timeout,
        CallError::TransientTransport(_) | CallError::NonTransient(_) => PolicyLayer::Transport,
    }
}
