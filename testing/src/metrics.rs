//! Metrics sink that records instead of exporting.

use meshguard_core::telemetry::{MetricsSink, SharedMetrics, Tag};
use std::sync::{Arc, Mutex, PoisonError};

/// Counter or histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// [`MetricsSink::increment`]
    Counter,
    /// [`MetricsSink::record`]
    Histogram,
}

/// One recorded emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Metric name
    pub name: &'static str,
    /// Counter or histogram
    pub kind: EventKind,
    /// 1.0 for counters, the recorded value for histograms
    pub value: f64,
    /// Tags in emission order
    pub tags: Vec<Tag>,
}

impl Event {
    /// Value of the tag `key`, if present.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Sink that keeps every emission in memory.
///
/// Clones share the same log, so keep one handle for assertions and inject
/// another with [`RecordingMetrics::shared`].
#[derive(Debug, Clone, Default)]
pub struct RecordingMetrics {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingMetrics {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injectable handle sharing this recorder's log.
    #[must_use]
    pub fn shared(&self) -> SharedMetrics {
        Arc::new(self.clone())
    }

    /// Number of emissions named `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|event| event.name == name).count()
    }

    /// Emissions named `name`, oldest first.
    #[must_use]
    pub fn events(&self, name: &str) -> Vec<Event> {
        self.lock()
            .iter()
            .filter(|event| event.name == name)
            .cloned()
            .collect()
    }

    /// Every emission, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, name: &'static str, kind: EventKind, value: f64, tags: &[Tag]) {
        self.lock().push(Event {
            name,
            kind,
            value,
            tags: tags.to_vec(),
        });
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &'static str, tags: &[Tag]) {
        self.push(name, EventKind::Counter, 1.0, tags);
    }

    fn record(&self, name: &'static str, value: f64, tags: &[Tag]) {
        self.push(name, EventKind::Histogram, value, tags);
    }
}
