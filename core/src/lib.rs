//! # Meshguard Core
//!
//! Leaf types shared by every Meshguard crate.
//!
//! - [`correlation`]: the [`CorrelationId`] value and the per-operation
//!   [`CorrelationContext`] slot that transport adapters thread through calls
//! - [`error`]: the failure taxonomy every policy classifies against
//! - [`telemetry`]: the narrow metrics producer interface and metric names
//! - [`message`]: message envelope and bus abstraction for the messaging adapter
//!
//! ## Architecture
//!
//! ```text
//! inbound adapter ──► CorrelationContext::set ──► handler
//!                                                   │
//!                                                   ▼
//!                          outbound adapter (reads context, injects header)
//!                                                   │
//!                                                   ▼
//!                                PolicyPipeline (meshguard-runtime)
//! ```
//!
//! Nothing in this crate performs I/O. Contexts are explicit values, passed
//! through request extensions and parameters, never stored in ambient
//! worker-keyed storage.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod correlation;
pub mod error;
pub mod message;
pub mod telemetry;

pub use correlation::{
    CORRELATION_ID_HEADER, CorrelationContext, CorrelationId, MESSAGE_CORRELATION_HEADER,
    RPC_CORRELATION_KEY,
};
pub use error::{CallError, CorrelationError, PolicyLayer, ResilienceError};
pub use message::{Message, MessageBus, MessageBusError, MessageStream};
pub use telemetry::{MetricsSink, NoopMetrics, SharedMetrics};
