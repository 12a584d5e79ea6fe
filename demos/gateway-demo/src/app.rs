//! Routers for the gateway and the in-process inventory service.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use meshguard_core::message::Message;
use meshguard_messaging::CorrelatedBus;
use meshguard_runtime::metrics::MetricsServer;
use meshguard_testing::InMemoryMessageBus;
use meshguard_web::{Correlation, ResilientHttpClient, correlation_layer};
use std::sync::Arc;

/// Topic order events are published on.
pub const ORDERS_TOPIC: &str = "orders";

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
    pub inventory: ResilientHttpClient,
    pub inventory_url: Arc<str>,
    pub bus: CorrelatedBus<InMemoryMessageBus>,
    pub metrics: Arc<MetricsServer>,
}

/// Gateway routes behind the correlation layer.
pub fn gateway(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stock/:sku", get(stock))
        .route("/orders", post(place_order))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(correlation_layer())
}

/// Downstream inventory service. Logs the id it received.
pub fn inventory() -> Router {
    Router::new()
        .route(
            "/stock/:sku",
            get(|Path(sku): Path<String>, correlation: Correlation| async move {
                tracing::info!(sku = %sku, "Inventory lookup");
                format!("{{\"sku\":\"{sku}\",\"available\":42,\"correlation_id\":\"{}\"}}", correlation.id())
            }),
        )
        .layer(correlation_layer())
}

async fn stock(
    State(state): State<AppState>,
    correlation: Correlation,
    Path(sku): Path<String>,
) -> Response {
    let url = format!("{}/stock/{sku}", state.inventory_url);
    match state.inventory.get(correlation.context(), &url).await {
        Ok(response) => {
            let status = response.status().as_u16();
            match response.text().await {
                Ok(body) => (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                    body,
                )
                    .into_response(),
                Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
            }
        }
        Err(err) if err.is_rejection() => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn place_order(State(state): State<AppState>, correlation: Correlation, body: Bytes) -> Response {
    let mut message = Message::new("OrderPlaced", body.to_vec());
    match state
        .bus
        .publish(correlation.context(), ORDERS_TOPIC, &mut message)
        .await
    {
        Ok(()) => (StatusCode::ACCEPTED, message.message_id).into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.render().map_or_else(
        || (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
        IntoResponse::into_response,
    )
}
