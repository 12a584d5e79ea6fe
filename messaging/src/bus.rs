//! Outbound message path: stamping plus the resilience pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshguard_messaging::CorrelatedBus;
//!
//! let bus = CorrelatedBus::new(broker, PolicyPipeline::standard("order-events", &options, metrics.clone()), metrics);
//!
//! let mut placed = Message::new("OrderPlaced", payload);
//! bus.publish(&correlation, "order-events", &mut placed).await?;
//! ```

use crate::propagation::stamp_correlation;
use meshguard_core::correlation::CorrelationContext;
use meshguard_core::error::{CallError, ResilienceError};
use meshguard_core::message::{Message, MessageBus, MessageBusError, MessageStream};
use meshguard_core::telemetry::{SharedMetrics, names, service_tag, tags};
use meshguard_runtime::pipeline::PolicyPipeline;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Delivery {
    Publish,
    Send,
}

impl Delivery {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Send => "send",
        }
    }
}

/// Decorates a [`MessageBus`] so every outbound message carries the current
/// correlation id and goes through a [`PolicyPipeline`].
#[derive(Clone)]
pub struct CorrelatedBus<B> {
    inner: B,
    pipeline: PolicyPipeline,
    metrics: SharedMetrics,
}

impl<B> std::fmt::Debug for CorrelatedBus<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatedBus")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl<B: MessageBus> CorrelatedBus<B> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: B, pipeline: PolicyPipeline, metrics: SharedMetrics) -> Self {
        Self {
            inner,
            pipeline,
            metrics,
        }
    }

    /// The decorated bus.
    #[must_use]
    pub const fn inner(&self) -> &B {
        &self.inner
    }

    /// The pipeline outbound messages go through.
    #[must_use]
    pub const fn pipeline(&self) -> &PolicyPipeline {
        &self.pipeline
    }

    /// Stamp `message` and publish it to `topic`.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's [`ResilienceError`] when every layer gave up.
    pub async fn publish(
        &self,
        context: &CorrelationContext,
        topic: &str,
        message: &mut Message,
    ) -> Result<(), ResilienceError> {
        stamp_correlation(message, context);
        self.deliver(Delivery::Publish, topic, message).await
    }

    /// Stamp `message` and send it to the single `destination` queue.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's [`ResilienceError`] when every layer gave up.
    pub async fn send(
        &self,
        context: &CorrelationContext,
        destination: &str,
        message: &mut Message,
    ) -> Result<(), ResilienceError> {
        stamp_correlation(message, context);
        self.deliver(Delivery::Send, destination, message).await
    }

    /// Subscribe through the decorated bus. Use [`crate::consume::consume`] to get a
    /// correlation context per message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the subscription cannot be created.
    pub async fn subscribe(&self, topics: &[&str]) -> Result<MessageStream, MessageBusError> {
        self.inner.subscribe(topics).await
    }

    async fn deliver(
        &self,
        delivery: Delivery,
        destination: &str,
        message: &Message,
    ) -> Result<(), ResilienceError> {
        let started = Instant::now();

        let result = self
            .pipeline
            .execute(move |attempt| async move {
                tracing::debug!(
                    service = %attempt.service,
                    attempt = attempt.attempt,
                    delivery = delivery.as_str(),
                    destination = %destination,
                    message_type = %message.message_type,
                    "Delivering message"
                );
                let outcome = match delivery {
                    Delivery::Publish => self.inner.publish(destination, message).await,
                    Delivery::Send => self.inner.send(destination, message).await,
                };
                outcome.map_err(CallError::from)
            })
            .await;

        if let Err(err) = &result {
            tracing::error!(
                delivery = delivery.as_str(),
                destination = %destination,
                message_id = %message.message_id,
                layer = %err.layer,
                error = %err.cause,
                "Message delivery failed"
            );
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record(
            names::REQUEST_DURATION_MS,
            elapsed_ms,
            &[
                service_tag(self.pipeline.service()),
                (tags::SUCCESS, result.is_ok().to_string()),
                (tags::PROTOCOL, "messaging".to_string()),
            ],
        );
        result
    }
}
