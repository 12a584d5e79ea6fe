//! Fake transport call with a scripted sequence of outcomes.

use meshguard_core::error::CallError;
use std::collections::VecDeque;
use std::future::{Ready, ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Plays back outcomes in order; the last one repeats forever.
///
/// Clones share the script and the invocation counter.
#[derive(Debug, Clone)]
pub struct ScriptedCall<T> {
    outcomes: Arc<Mutex<VecDeque<Result<T, CallError>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedCall<()> {
    /// Fail every invocation with `error`.
    #[must_use]
    pub fn always(error: CallError) -> Self {
        Self::new(vec![Err(error)])
    }
}

impl<T: Clone> ScriptedCall<T> {
    /// Play back `outcomes`. An empty script fails non-transiently.
    #[must_use]
    pub fn new(outcomes: Vec<Result<T, CallError>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail `failures` times with `error`, then succeed with `value`.
    #[must_use]
    pub fn fail_times(failures: usize, error: CallError, value: T) -> Self {
        let mut outcomes: Vec<_> = std::iter::repeat_n(Err(error), failures).collect();
        outcomes.push(Ok(value));
        Self::new(outcomes)
    }

    /// Succeed every time with `value`.
    #[must_use]
    pub fn succeed(value: T) -> Self {
        Self::new(vec![Ok(value)])
    }

    /// Take the next outcome. The argument (usually the attempt context) is ignored.
    pub fn invoke<C>(&self, _context: C) -> Ready<Result<T, CallError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = if outcomes.len() > 1 {
            outcomes.pop_front()
        } else {
            outcomes.front().cloned()
        };
        ready(outcome.unwrap_or_else(|| Err(CallError::non_transient("no scripted outcome"))))
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_outcome_repeats() {
        let call = ScriptedCall::fail_times(2, CallError::transient("503"), 7);

        assert!(call.invoke(()).await.is_err());
        assert!(call.invoke(()).await.is_err());
        assert_eq!(call.invoke(()).await.unwrap(), 7);
        assert_eq!(call.invoke(()).await.unwrap(), 7);
        assert_eq!(call.calls(), 4);
    }

    #[tokio::test]
    async fn test_empty_script_fails() {
        let call = ScriptedCall::<u8>::new(Vec::new());
        assert!(!call.invoke(()).await.unwrap_err().is_transient());
    }
}
