//! Message bus integration for Meshguard.
//!
//! # Message Flow
//!
//! ```text
//! handler with CorrelationContext
//!   └─ CorrelatedBus::publish / send
//!        ├─ stamp X-Correlation-ID
//!        └─ PolicyPipeline → MessageBus
//!                               │
//!                            broker
//!                               │
//! consume ◄─ MessageBus::subscribe
//!   ├─ extract id (header → broker field → new)
//!   └─ handler runs in a `message_consume` span with its own context
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod consume;
pub mod propagation;

pub use bus::CorrelatedBus;
pub use consume::{ConsumedMessage, ConsumerOptions, consume, correlated};
pub use propagation::{extract_correlation, stamp_correlation};
