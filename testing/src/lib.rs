//! # Meshguard Testing
//!
//! Test doubles for the Meshguard crates.
//!
//! This crate provides:
//! - [`RecordingMetrics`]: a metrics sink that keeps every emission for assertions
//! - [`ScriptedCall`]: a fake transport that plays back a list of outcomes
//! - [`LogCapture`]: a tracing subscriber writing into an inspectable buffer
//! - [`InMemoryMessageBus`]: a broadcast-backed [`MessageBus`](meshguard_core::MessageBus)
//!
//! ## Example
//!
//! ```ignore
//! use meshguard_testing::{RecordingMetrics, ScriptedCall};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_retry_then_success() {
//!     let metrics = RecordingMetrics::new();
//!     let pipeline = PolicyPipeline::standard("orders", &options, metrics.shared());
//!     let transport = ScriptedCall::fail_times(2, CallError::transient("503"), "ok");
//!
//!     assert_eq!(pipeline.execute(|ctx| transport.invoke(ctx)).await.unwrap(), "ok");
//!     assert_eq!(metrics.count(names::RETRY_TOTAL), 2);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod logs;
mod message_bus;
mod metrics;
mod scripted;

pub use logs::{CaptureWriter, LogCapture};
pub use message_bus::InMemoryMessageBus;
pub use metrics::{Event, EventKind, RecordingMetrics};
pub use scripted::ScriptedCall;
