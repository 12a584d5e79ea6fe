//! Correlation headers on message envelopes.

use meshguard_core::correlation::{CorrelationContext, CorrelationId, MESSAGE_CORRELATION_HEADER};
use meshguard_core::message::Message;

/// Set the current correlation id on `message`, replacing any existing
/// correlation header in any case.
///
/// Returns `false` and leaves the message untouched when the context holds no id.
pub fn stamp_correlation(message: &mut Message, context: &CorrelationContext) -> bool {
    let Some(id) = context.get() else {
        return false;
    };
    message.set_header(MESSAGE_CORRELATION_HEADER, id.as_str());
    tracing::debug!(
        correlation_id = %id,
        message_id = %message.message_id,
        message_type = %message.message_type,
        "Stamped correlation id on message"
    );
    true
}

/// Correlation id of an inbound message.
///
/// The correlation header wins, then the broker-assigned correlation field.
/// A new id is generated when neither holds a usable value.
#[must_use]
pub fn extract_correlation(message: &Message) -> CorrelationId {
    message
        .header(MESSAGE_CORRELATION_HEADER)
        .and_then(|raw| CorrelationId::parse(raw).ok())
        .or_else(|| {
            message
                .correlation_id
                .as_deref()
                .and_then(|raw| CorrelationId::parse(raw).ok())
        })
        .unwrap_or_else(CorrelationId::generate)
}
