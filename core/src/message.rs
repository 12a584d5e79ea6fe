//! Message envelope and bus abstraction for asynchronous hops.
//!
//! The bus is the boundary to whatever broker a deployment uses. Meshguard
//! only decorates it: stamping correlation headers on the way out, extracting
//! them on the way in, and running outbound calls through a policy pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshguard_core::message::{Message, MessageBus};
//!
//! async fn example(bus: impl MessageBus) {
//!     let message = Message::new("OrderPlaced", b"{}".to_vec());
//!     bus.publish("order-events", &message).await?;
//!
//!     let mut stream = bus.subscribe(&["order-events"]).await?;
//!     while let Some(result) = stream.next().await {
//!         // ...
//!     }
//! }
//! ```

use crate::error::CallError;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// A message travelling through the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-level unique id of this message
    pub message_id: String,
    /// Logical message type (e.g. `OrderPlaced`)
    pub message_type: String,
    /// Opaque payload; codecs are the caller's business
    pub payload: Vec<u8>,
    /// Application headers. Look up with [`Message::header`] for case-insensitive access.
    pub headers: BTreeMap<String, String>,
    /// Broker-assigned correlation field, when the broker has one
    pub correlation_id: Option<String>,
}

impl Message {
    /// Create a message with a fresh id and no headers.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            payload,
            headers: BTreeMap::new(),
            correlation_id: None,
        }
    }

    /// Set the broker-level correlation field.
    #[must_use]
    pub fn with_broker_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add a header, replacing any existing header of the same name (any case).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Set a header, removing every existing header whose name matches in any case.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
    }
}

/// Errors from bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageBusError {
    /// Could not reach the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker refused or failed the publish
    #[error("Publish failed for '{destination}': {reason}")]
    PublishFailed {
        /// Topic or queue
        destination: String,
        /// Reason reported by the broker
        reason: String,
    },

    /// Subscribing failed
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// Requested topics
        topics: Vec<String>,
        /// Reason reported by the broker
        reason: String,
    },

    /// Topic or queue name was rejected
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Payload could not be decoded
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}

impl MessageBusError {
    /// Whether a retry might succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::PublishFailed { .. })
    }
}

impl From<MessageBusError> for CallError {
    fn from(err: MessageBusError) -> Self {
        if err.is_transient() {
            Self::TransientTransport(err.to_string())
        } else {
            Self::NonTransient(err.to_string())
        }
    }
}

/// Stream of consumed messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, MessageBusError>> + Send>>;

/// Boxed future returned by [`MessageBus`] operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MessageBusError>> + Send + 'a>>;

/// Broker boundary.
///
/// `publish` fans out to every subscriber of a topic; `send` delivers a
/// command to one destination queue. Both carry the same headers.
pub trait MessageBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the broker rejects the message.
    fn publish<'a>(&'a self, topic: &'a str, message: &'a Message) -> BusFuture<'a, ()>;

    /// Send a command to a single destination.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the broker rejects the message.
    fn send<'a>(&'a self, destination: &'a str, message: &'a Message) -> BusFuture<'a, ()>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError`] if the subscription cannot be created.
    fn subscribe<'a>(&'a self, topics: &'a [&'a str]) -> BusFuture<'a, MessageStream>;
}
