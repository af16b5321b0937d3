//! Health check handlers for the consumer and producer services.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), consumer only
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use core_config::AppInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::metrics;
use crate::registry::ConsumerRegistry;

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(app): State<AppInfo>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: app.name,
        version: app.version,
    })
}

/// Readiness probe handler.
///
/// Ready once persisted consumers have been restored and the broker answers.
pub async fn ready_handler(
    State(registry): State<Arc<ConsumerRegistry>>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if !registry.is_restored() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "restore": "pending" }
            })),
        ));
    }

    match registry.broker().health_check().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "restore": "ok", "broker": "ok" }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "restore": "ok", "broker": format!("error: {}", e) }
            })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Liveness and metrics endpoints:
/// - `/health`, `/healthz`
/// - `/metrics`
pub fn health_router(app: AppInfo) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(app)
}

/// Readiness endpoints backed by the consumer registry:
/// - `/ready`, `/readyz`
pub fn ready_router(registry: Arc<ConsumerRegistry>) -> Router {
    Router::new()
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .with_state(registry)
}
