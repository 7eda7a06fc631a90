//! # Health & Observability Endpoints
//!
//! | Endpoint | Purpose | K8s Probe |
//! |----------|---------|-----------|
//! | `GET /healthz` | Liveness: process is alive | `livenessProbe` |
//! | `GET /readyz` | Readiness: registry reachable | `readinessProbe` |
//! | `GET /metrics` | Prometheus scraping endpoint | `ServiceMonitor` |
//!
//! Readiness runs `SELECT 1` with a 2-second timeout when PostgreSQL backs the
//! registry. The in-memory registry is always ready.

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::sync::Arc;

/// Liveness probe: returns 200 if the process is running.
pub async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 503 while the database is unreachable.
pub async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(db) = state.database.as_ref() else {
        return (StatusCode::OK, "ok");
    };
    let check = tokio::time::timeout(std::time::Duration::from_secs(2), db.health_check()).await;

    match check {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }
}

/// Prometheus metrics in text exposition format.
pub async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.prom_metrics.encode();
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
}
