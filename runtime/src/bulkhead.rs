//! Bulkhead for isolating one dependency's concurrency.
//!
//! Named after ship bulkheads that keep water in one compartment: at most
//! `max_parallelization` calls run at once and at most `max_queuing` wait for
//! a slot. Anything beyond that is rejected immediately and never retried.
//!
//! # Example
//!
//! ```rust
//! use meshguard_core::{CallError, NoopMetrics};
//! use meshguard_runtime::bulkhead::{Bulkhead, BulkheadConfig};
//!
//! # async fn example() {
//! let bulkhead = Bulkhead::new("payments", BulkheadConfig::new(5, 10), NoopMetrics::shared());
//!
//! let result = bulkhead
//!     .execute(|| async { Ok::<_, CallError>("charged") })
//!     .await;
//! # }
//! ```

use crate::failure::PolicyFailure;
use meshguard_core::error::{CallError, PolicyLayer};
use meshguard_core::telemetry::{SharedMetrics, names, service_tag};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, TryAcquireError};

/// Bulkhead limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Calls allowed to run concurrently
    pub max_parallelization: usize,
    /// Calls allowed to wait for a running slot
    pub max_queuing: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_parallelization: 10,
            max_queuing: 20,
        }
    }
}

impl BulkheadConfig {
    /// Limits with `max_parallelization` running and `max_queuing` waiting.
    #[must_use]
    pub const fn new(max_parallelization: usize, max_queuing: usize) -> Self {
        Self {
            max_parallelization,
            max_queuing,
        }
    }
}

/// Gives the queue slot back when the waiter is admitted or dropped.
struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Concurrency cap for one logical downstream service.
///
/// Cloning shares the slots.
#[derive(Clone)]
pub struct Bulkhead {
    service: Arc<str>,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    metrics: SharedMetrics,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("service", &self.service)
            .field("config", &self.config)
            .field("available", &self.available_permits())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    /// Create a bulkhead.
    #[must_use]
    pub fn new(service: impl Into<Arc<str>>, config: BulkheadConfig, metrics: SharedMetrics) -> Self {
        Self {
            service: service.into(),
            semaphore: Arc::new(Semaphore::new(config.max_parallelization)),
            queued: Arc::new(AtomicUsize::new(0)),
            config,
            metrics,
        }
    }

    /// Run `operation` inside the bulkhead.
    ///
    /// Takes a free slot if there is one, otherwise waits in the queue if the
    /// queue has room. The slot is released when `operation` completes or is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns a bulkhead rejection (built through [`PolicyFailure`]) when both
    /// slots and queue are full, otherwise whatever `operation` returned.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: PolicyFailure,
    {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                let Some(slot) = self.enqueue() else {
                    return Err(self.reject());
                };
                let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
                drop(slot);
                match acquired {
                    Ok(permit) => permit,
                    Err(_closed) => return Err(self.reject()),
                }
            }
            Err(TryAcquireError::Closed) => return Err(self.reject()),
        };

        let result = operation().await;
        drop(permit);
        result
    }

    /// Free running slots.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Calls currently waiting for a slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// The limits.
    #[must_use]
    pub const fn config(&self) -> BulkheadConfig {
        self.config
    }

    fn enqueue(&self) -> Option<QueueSlot> {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < self.config.max_queuing).then_some(queued + 1)
            })
            .ok()
            .map(|_| QueueSlot(Arc::clone(&self.queued)))
    }

    fn reject<E: PolicyFailure>(&self) -> E {
        tracing::warn!(
            service = %self.service,
            max_parallelization = self.config.max_parallelization,
            max_queuing = self.config.max_queuing,
            "Bulkhead rejected call"
        );
        self.metrics
            .increment(names::BULKHEAD_REJECTION_TOTAL, &[service_tag(&self.service)]);
        E::rejected(
            &self.service,
            PolicyLayer::Bulkhead,
            CallError::BulkheadRejected {
                service: self.service.to_string(),
            },
        )
    }
}
