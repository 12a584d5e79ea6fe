//! Broadcast-backed message bus for tests.
//!
//! Topics and destination queues share one namespace: `send` to `"orders"`
//! reaches subscribers of `"orders"` exactly like `publish` does. Every
//! outbound message is also kept for inspection.

use futures::stream;
use meshguard_core::message::{BusFuture, Message, MessageBus, MessageBusError, MessageStream};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, broadcast::Sender<Message>>,
    outbound: Vec<(String, Message)>,
    failures: VecDeque<MessageBusError>,
}

/// In-memory [`MessageBus`].
///
/// Clones share topics, recorded messages and queued failures.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next outbound operation with `error`. Failures queue up.
    pub fn fail_next(&self, error: MessageBusError) {
        self.lock().failures.push_back(error);
    }

    /// Every message published or sent, with its destination, oldest first.
    #[must_use]
    pub fn outbound(&self) -> Vec<(String, Message)> {
        self.lock().outbound.clone()
    }

    /// Messages published or sent to `destination`, oldest first.
    #[must_use]
    pub fn outbound_to(&self, destination: &str) -> Vec<Message> {
        self.lock()
            .outbound
            .iter()
            .filter(|(name, _)| name == destination)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Deliver `message` to subscribers of `topic` as if a remote producer had
    /// published it. Nothing is recorded as outbound.
    pub fn inject(&self, topic: &str, message: Message) {
        let sender = Self::sender(&mut self.lock(), topic);
        // No subscribers is not an error for a broadcast bus.
        let _ = sender.send(message);
    }

    /// Drop every topic so open subscriptions end.
    pub fn close(&self) {
        self.lock().topics.clear();
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(state: &mut BusState, topic: &str) -> broadcast::Sender<Message> {
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn deliver(&self, destination: &str, message: &Message) -> Result<(), MessageBusError> {
        if destination.trim().is_empty() {
            return Err(MessageBusError::InvalidDestination(destination.to_string()));
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state
            .outbound
            .push((destination.to_string(), message.clone()));
        let sender = Self::sender(&mut state, destination);
        drop(state);

        let _ = sender.send(message.clone());
        Ok(())
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish<'a>(&'a self, topic: &'a str, message: &'a Message) -> BusFuture<'a, ()> {
        Box::pin(async move { self.deliver(topic, message) })
    }

    fn send<'a>(&'a self, destination: &'a str, message: &'a Message) -> BusFuture<'a, ()> {
        Box::pin(async move { self.deliver(destination, message) })
    }

    fn subscribe<'a>(&'a self, topics: &'a [&'a str]) -> BusFuture<'a, MessageStream> {
        Box::pin(async move {
            if topics.is_empty() {
                return Err(MessageBusError::SubscriptionFailed {
                    topics: Vec::new(),
                    reason: "no topics requested".to_string(),
                });
            }

            let receivers: Vec<_> = {
                let mut state = self.lock();
                topics
                    .iter()
                    .map(|topic| Self::sender(&mut state, topic).subscribe())
                    .collect()
            };

            let streams = receivers.into_iter().map(|mut rx| {
                Box::pin(async_stream::stream! {
                    loop {
                        match rx.recv().await {
                            Ok(message) => yield Ok(message),
                            Err(RecvError::Lagged(skipped)) => {
                                yield Err(MessageBusError::ConnectionFailed(format!(
                                    "subscriber lagged by {skipped} messages"
                                )));
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                })
            });

            Ok(Box::pin(stream::select_all(streams)) as MessageStream)
        })
    }
}
