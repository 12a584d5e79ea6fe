//! Inbound message path: one correlation context per consumed message.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshguard_messaging::consume::{ConsumerOptions, consume};
//!
//! consume(&bus, &["order-events"], ConsumerOptions::default(), |message, correlation| async move {
//!     tracing::info!(message_type = %message.message_type, "Handling event");
//!     inventory.reserve(&correlation, &message).await
//! })
//! .await?;
//! ```

use crate::propagation::extract_correlation;
use futures::{Stream, StreamExt};
use meshguard_core::correlation::CorrelationContext;
use meshguard_core::message::{Message, MessageBus, MessageBusError, MessageStream};
use std::fmt::Display;
use std::future::Future;
use tracing::Instrument;

/// A consumed message with the correlation context established for it.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    /// The message as delivered
    pub message: Message,
    /// Fresh context holding the message's correlation id
    pub context: CorrelationContext,
}

impl ConsumedMessage {
    /// Establish the context for `message`.
    #[must_use]
    pub fn new(message: Message) -> Self {
        let context = CorrelationContext::with_id(extract_correlation(&message));
        Self { message, context }
    }
}

/// Attach a fresh [`CorrelationContext`] to every message of `stream`.
pub fn correlated(stream: MessageStream) -> impl Stream<Item = Result<ConsumedMessage, MessageBusError>> + Send {
    stream.map(|result| result.map(ConsumedMessage::new))
}

/// Settings for [`consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Messages handled at the same time
    pub concurrency: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self { concurrency: 16 }
    }
}

/// Subscribe to `topics` and run `handler` for every message until the
/// stream ends.
///
/// Each message gets its own context and runs inside a `message_consume`
/// span carrying its correlation id, so concurrently handled messages never
/// share an id. Handler failures and stream errors are logged and consumption
/// continues.
///
/// # Errors
///
/// Returns [`MessageBusError`] if the subscription cannot be created.
pub async fn consume<B, H, Fut, E>(
    bus: &B,
    topics: &[&str],
    options: ConsumerOptions,
    handler: H,
) -> Result<(), MessageBusError>
where
    B: MessageBus + ?Sized,
    H: Fn(Message, CorrelationContext) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let stream = bus.subscribe(topics).await?;
    tracing::info!(topics = ?topics, concurrency = options.concurrency, "Consuming messages");

    let handler = &handler;
    correlated(stream)
        .for_each_concurrent(options.concurrency.max(1), |result| async move {
            match result {
                Ok(consumed) => handle(consumed, handler).await,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to receive message");
                }
            }
        })
        .await;

    tracing::info!(topics = ?topics, "Message stream ended");
    Ok(())
}

async fn handle<H, Fut, E>(consumed: ConsumedMessage, handler: &H)
where
    H: Fn(Message, CorrelationContext) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let ConsumedMessage { message, context } = consumed;
    let correlation_id = context.get_or_generate();
    let span = tracing::info_span!(
        "message_consume",
        correlation_id = %correlation_id,
        message_type = %message.message_type,
    );

    async move {
        let message_id = message.message_id.clone();
        tracing::debug!(message_id = %message_id, "Message received");
        if let Err(err) = handler(message, context).await {
            tracing::error!(message_id = %message_id, error = %err, "Message handler failed");
        }
    }
    .instrument(span)
    .await;
}
