//! Gateway Demo - correlation and resilience end to end
//!
//! Runs three things in one process:
//! - an inventory service on a random loopback port
//! - a gateway calling it through `ResilientHttpClient`
//! - a consumer for order events published by the gateway
//!
//! # Running the Example
//!
//! ```bash
//! cargo run -p gateway-demo
//! curl -H 'X-Correlation-ID: demo-1' http://localhost:8080/stock/sku-42
//! curl -X POST -d '{"sku":"sku-42"}' http://localhost:8080/orders
//! curl http://localhost:8080/metrics
//! ```
//!
//! Resilience settings come from the TOML file named by
//! `MESHGUARD_RESILIENCE_CONFIG`; defaults apply when it is unset.

#![allow(missing_docs)]

mod app;

use app::{AppState, ORDERS_TOPIC};
use meshguard_messaging::{ConsumerOptions, CorrelatedBus, consume};
use meshguard_runtime::metrics::{MetricsServer, PrometheusMetrics};
use meshguard_runtime::options::ResiliencePolicyOptions;
use meshguard_runtime::pipeline::PolicyPipeline;
use meshguard_testing::InMemoryMessageBus;
use meshguard_web::ResilientHttpClient;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const GATEWAY_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meshguard=debug,gateway_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Gateway Demo");

    let options = ResiliencePolicyOptions::from_env()?;
    tracing::info!(services = options.services.len(), "Resilience options loaded");

    let gateway_addr: SocketAddr = GATEWAY_ADDR.parse()?;
    let mut metrics_server = MetricsServer::new(gateway_addr);
    metrics_server.start()?;
    let metrics = PrometheusMetrics::shared();

    // Downstream inventory service
    let inventory_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let inventory_addr = inventory_listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(inventory_listener, app::inventory()).await {
            tracing::error!(error = %err, "Inventory service stopped");
        }
    });
    tracing::info!(addr = %inventory_addr, "Inventory service listening");

    // Order events
    let bus = InMemoryMessageBus::new();
    let consumer_bus = bus.clone();
    tokio::spawn(async move {
        let consumed = consume(
            &consumer_bus,
            &[ORDERS_TOPIC],
            ConsumerOptions::default(),
            |message, _context| async move {
                tracing::info!(
                    message_id = %message.message_id,
                    bytes = message.payload.len(),
                    "Order event consumed"
                );
                Ok::<_, Infallible>(())
            },
        )
        .await;
        if let Err(err) = consumed {
            tracing::error!(error = %err, "Order consumer stopped");
        }
    });

    let state = AppState {
        inventory: ResilientHttpClient::new(
            reqwest::Client::new(),
            PolicyPipeline::for_service("inventory", &options, Arc::clone(&metrics)),
            Arc::clone(&metrics),
        ),
        inventory_url: format!("http://{inventory_addr}").into(),
        bus: CorrelatedBus::new(
            bus.clone(),
            PolicyPipeline::standard(ORDERS_TOPIC, &options, Arc::clone(&metrics)),
            Arc::clone(&metrics),
        ),
        metrics: Arc::new(metrics_server),
    };

    let listener = tokio::net::TcpListener::bind(gateway_addr).await?;
    tracing::info!(addr = %gateway_addr, "Gateway listening");

    axum::serve(
        listener,
        app::gateway(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received, stopping...");
    })
    .await?;

    bus.close();
    tracing::info!("Clean shutdown complete");
    Ok(())
}
