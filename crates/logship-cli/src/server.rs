//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use logship_core::health::{ComponentStatus, HealthCheck, HealthStatus};
use logship_core::metrics::RelayMetrics;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<RelayMetrics>,
    pub metrics_prefix: String,
}

/// Health response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub components: std::collections::HashMap<String, ComponentStatusResponse>,
}

/// Component status response.
#[derive(Debug, Serialize)]
pub struct ComponentStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentStatusResponse {
    fn from(status: &ComponentStatus) -> Self {
        match status {
            ComponentStatus::Healthy => ComponentStatusResponse {
                status: "healthy".to_string(),
                message: None,
            },
            ComponentStatus::Degraded(msg) => ComponentStatusResponse {
                status: "degraded".to_string(),
                message: Some(msg.clone()),
            },
            ComponentStatus::Unhealthy(msg) => ComponentStatusResponse {
                status: "unhealthy".to_string(),
                message: Some(msg.clone()),
            },
            ComponentStatus::Unknown => ComponentStatusResponse {
                status: "unknown".to_string(),
                message: None,
            },
        }
    }
}

/// Start the HTTP server for health and metrics. Returns once the listener
/// is bound; the server itself runs until `shutdown` fires.
pub async fn start_server(state: Arc<ServerState>, address: &str, shutdown: CancellationToken) {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, address, "Failed to bind metrics server");
            return;
        }
    };
    info!(address, "Metrics server started");

    tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "Metrics server error");
        }
    });
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let overall = state.health.overall_status();
    let components = state
        .health
        .get_all_statuses()
        .iter()
        .map(|(name, status)| (name.clone(), ComponentStatusResponse::from(status)))
        .collect();

    let (code, label) = match overall {
        HealthStatus::Healthy => (StatusCode::OK, "healthy"),
        HealthStatus::Degraded => (StatusCode::OK, "degraded"),
        HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };

    (
        code,
        Json(HealthResponse {
            status: label.to_string(),
            uptime_seconds: state.health.uptime_seconds(),
            components,
        }),
    )
}

async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.health.overall_status() {
        HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        _ => (StatusCode::OK, "ok"),
    }
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.is_operational() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .export_prometheus_text_with_prefix(&state.metrics_prefix);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}
