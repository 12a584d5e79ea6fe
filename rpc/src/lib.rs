//! tonic integration for Meshguard.
//!
//! - [`server::CorrelationGrpcLayer`] establishes a correlation context for
//!   every inbound call, whatever its streaming shape.
//! - [`client::CorrelationClientInterceptor`] carries the id to downstream
//!   RPC services.
//! - [`client::ResilientGrpc`] runs calls through the RPC call class with a
//!   per-call deadline.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod metadata;
pub mod server;

pub use client::{CorrelationClientInterceptor, ResilientGrpc, classify_status, correlated_request};
pub use metadata::{correlation_from_metadata, with_correlation};
pub use server::{
    CorrelationExt, CorrelationGrpcLayer, CorrelationGrpcService, CorrelationServerInterceptor,
};
