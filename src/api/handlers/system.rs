//! Liveness endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;

/// Gateway liveness report.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when the projection no longer answers.
    status: &'static str,
    timestamp: DateTime<Utc>,
    version: &'static str,
    /// `postgres` or `memory`.
    store: &'static str,
    /// Live feed receivers: projection feeds plus subscription forwarders.
    feed_receivers: usize,
}

/// `GET /health`: Gateway liveness.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Probes the projection actor and reports the store backend and the number of live feed receivers. Answers 503 when the projection has stopped.",
    responses(
        (status = 200, description = "Gateway is healthy", body = HealthResponse),
        (status = 503, description = "Projection stopped", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Any reply, even for an unknown device, proves the actor is running.
    let projection_alive = state.engine.projection().ref_count("").await.is_ok();
    let (code, status) = if projection_alive {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let store = if state.config.persistence_enabled {
        "postgres"
    } else {
        "memory"
    };
    (
        code,
        Json(HealthResponse {
            status,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            store,
            feed_receivers: state.event_bus.receiver_count(),
        }),
    )
}

/// Routes mounted outside `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
