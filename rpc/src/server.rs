//! Inbound correlation for tonic servers.
//!
//! Admission happens on the initial HTTP/2 request, which is the same for
//! unary, client-streaming, server-streaming and duplex calls, so one layer
//! covers every call shape before any handler code runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshguard_rpc::server::{CorrelationExt, CorrelationGrpcLayer};
//!
//! Server::builder()
//!     .layer(CorrelationGrpcLayer)
//!     .add_service(OrdersServer::new(orders))
//!     .serve(addr)
//!     .await?;
//!
//! async fn place_order(&self, request: Request<PlaceOrder>) -> Result<Response<OrderId>, Status> {
//!     let correlation = request.correlation_context();
//!     // pass `correlation` to outbound calls
//! }
//! ```

use crate::metadata::correlation_from_metadata;
use http::HeaderMap;
use meshguard_core::correlation::{CorrelationContext, CorrelationId, RPC_CORRELATION_KEY};
use std::task::{Context, Poll};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tower::{Layer, Service};
use tracing::Instrument;
use tracing::instrument::Instrumented;

/// Tower layer establishing a correlation context for every admitted call.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationGrpcLayer;

impl<S> Layer<S> for CorrelationGrpcLayer {
    type Service = CorrelationGrpcService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationGrpcService { inner }
    }
}

/// Service created by [`CorrelationGrpcLayer`].
#[derive(Clone, Debug)]
pub struct CorrelationGrpcService<S> {
    inner: S,
}

impl<S, B> Service<http::Request<B>> for CorrelationGrpcService<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Instrumented<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let correlation_id = header_correlation(req.headers()).unwrap_or_else(CorrelationId::generate);
        req.extensions_mut()
            .insert(CorrelationContext::with_id(correlation_id.clone()));
        req.extensions_mut().insert(correlation_id.clone());

        let span = tracing::info_span!(
            "grpc_request",
            correlation_id = %correlation_id,
            method = %req.uri().path(),
        );
        span.in_scope(|| tracing::debug!("Correlation id established for call"));

        self.inner.call(req).instrument(span)
    }
}

fn header_correlation(headers: &HeaderMap) -> Option<CorrelationId> {
    headers
        .iter()
        .find(|(name, _)| name.as_str().eq_ignore_ascii_case(RPC_CORRELATION_KEY))
        .and_then(|(_, value)| value.to_str().ok())
        .and_then(|raw| CorrelationId::parse(raw).ok())
}

/// Interceptor doing the same admission for `InterceptedService`.
///
/// A context already installed by [`CorrelationGrpcLayer`] is kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationServerInterceptor;

impl Interceptor for CorrelationServerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if request.extensions().get::<CorrelationContext>().is_none() {
            let correlation_id =
                correlation_from_metadata(request.metadata()).unwrap_or_else(CorrelationId::generate);
            tracing::debug!(correlation_id = %correlation_id, "Correlation id established for call");
            request
                .extensions_mut()
                .insert(CorrelationContext::with_id(correlation_id));
        }
        Ok(request)
    }
}

/// Access to the correlation context of an inbound tonic request.
pub trait CorrelationExt {
    /// The admitted context, or one built from metadata when no admission
    /// layer ran.
    fn correlation_context(&self) -> CorrelationContext;

    /// Shorthand for the current id.
    fn correlation_id(&self) -> CorrelationId {
        self.correlation_context().get_or_generate()
    }
}

impl<T> CorrelationExt for Request<T> {
    fn correlation_context(&self) -> CorrelationContext {
        self.extensions()
            .get::<CorrelationContext>()
            .cloned()
            .unwrap_or_else(|| {
                CorrelationContext::with_id(
                    correlation_from_metadata(self.metadata())
                        .unwrap_or_else(CorrelationId::generate),
                )
            })
    }
}
