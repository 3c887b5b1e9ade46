//! Logging initialization and the metrics HTTP endpoint.

use crate::metrics::Metrics;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(String),

    #[error("Failed to bind metrics port: {0}")]
    MetricsPort(#[from] std::io::Error),
}

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,palisade=debug";

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`.
pub fn init_logging(default_filter: &str) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| TelemetryError::SetSubscriber(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Prometheus HTTP Server
// ═══════════════════════════════════════════════════════════════════════════

/// Routes:
/// - `GET /metrics` - Prometheus text format
/// - `GET /health` - liveness probe
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

/// Bind `port` and serve the metrics router on the current tokio runtime.
pub async fn serve_metrics(
    port: u16,
    metrics: Arc<Metrics>,
) -> Result<tokio::task::JoinHandle<()>, TelemetryError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(port, "Starting metrics server on http://{}", addr);

    let app = metrics_router(metrics);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "Metrics server error");
        }
    }))
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics.registry().gather(), &mut buffer) {
        tracing::error!(error = ?e, "Failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}
