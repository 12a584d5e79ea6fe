//! Custom Axum extractors.
//!
//! - `Correlation`: the request's correlation context
//! - `ClientIp`: client address by header priority
//! - `UserAgent`: the `User-Agent` header
//!
//! # Examples
//!
//! ```ignore
//! use meshguard_web::extractors::{ClientIp, Correlation, UserAgent};
//!
//! async fn handler(
//!     correlation: Correlation,
//!     client_ip: ClientIp,
//!     user_agent: UserAgent,
//! ) -> String {
//!     tracing::info!(client_ip = %client_ip.0, user_agent = %user_agent.0, "Processing request");
//!     correlation.id().to_string()
//! }
//! ```

use crate::middleware::resolve_correlation_id;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use meshguard_core::correlation::{CorrelationContext, CorrelationId};
use std::net::SocketAddr;

/// Fallback when no client address can be determined.
pub const UNKNOWN: &str = "Unknown";

/// Correlation context of the current request.
///
/// Uses the context installed by
/// [`CorrelationLayer`](crate::middleware::CorrelationLayer). Without the
/// layer, a context is built from the request headers on the spot.
#[derive(Debug, Clone)]
pub struct Correlation(pub CorrelationContext);

impl Correlation {
    /// Current id, generating one if the context is empty.
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.0.get_or_generate()
    }

    /// The context, to pass to outbound calls.
    #[must_use]
    pub const fn context(&self) -> &CorrelationContext {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Correlation
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = parts
            .extensions
            .get::<CorrelationContext>()
            .cloned()
            .unwrap_or_else(|| {
                CorrelationContext::with_id(resolve_correlation_id(&parts.headers, &parts.extensions))
            });

        Ok(Self(context))
    }
}

/// Client address.
///
/// # Priority
///
/// 1. `X-Forwarded-For` (first entry)
/// 2. `X-Real-IP`
/// 3. Socket remote address (needs `into_make_service_with_connect_info`)
/// 4. `"Unknown"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(client_ip(&parts.headers, parts.extensions.get())))
    }
}

/// Resolve the client address by header priority.
///
/// Header values are reported as sent (trimmed), whether or not they parse
/// as an address; only blank values fall through.
#[must_use]
pub fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    let forwarded = header_value(headers, "X-Forwarded-For")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    forwarded
        .or_else(|| header_value(headers, "X-Real-IP"))
        .map(str::to_string)
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// `User-Agent` header.
///
/// Returns "Unknown" if not present.
#[derive(Debug, Clone)]
pub struct UserAgent(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserAgent
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(user_agent(&parts.headers)))
    }
}

pub(crate) fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(UNKNOWN)
        .to_string()
}
