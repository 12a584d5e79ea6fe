//! Axum integration for Meshguard.
//!
//! # Request Flow
//!
//! ```text
//! inbound request
//!   └─ CorrelationLayer          ← resolve id, span, logs, echo header
//!        └─ handler              ← Correlation extractor hands out the context
//!             └─ ResilientHttpClient
//!                  ├─ inject X-Correlation-ID
//!                  └─ PolicyPipeline (breaker → retry → timeout → reqwest)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::get, extract::State};
//! use meshguard_web::{Correlation, ResilientHttpClient, correlation_layer};
//!
//! async fn stock(State(client): State<ResilientHttpClient>, correlation: Correlation) -> String {
//!     client
//!         .get(correlation.context(), "http://inventory/api/stock/42")
//!         .await
//!         .map(|response| response.status().to_string())
//!         .unwrap_or_else(|err| err.to_string())
//! }
//!
//! let app = Router::new()
//!     .route("/stock", get(stock))
//!     .with_state(client)
//!     .layer(correlation_layer());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod extractors;
pub mod middleware;

pub use client::{
    PropagateCorrelation, PropagateCorrelationLayer, ResilientHttpClient, classify_reqwest_error,
    inject_correlation_header,
};
pub use extractors::{ClientIp, Correlation, UserAgent};
pub use middleware::{
    CorrelationLayer, CorrelationMiddleware, InboundOptions, correlation_layer,
    resolve_correlation_id,
};
