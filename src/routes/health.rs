use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Liveness: the process is up and the runtime answers.
pub async fn liveness() -> impl IntoResponse {
    let response = HealthResponse {
        status: "alive".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, Json(response))
}

/// Readiness: dependencies are open and the supervisor is not draining.
/// Flips to 503 the moment shutdown starts so the gateway stops routing
/// new submissions here.
pub async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
        );
    }

    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let cache_ok = state.cache.ping().await.is_ok();

    if db_ok && cache_ok {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
        )
    } else {
        tracing::warn!(db_ok, cache_ok, "Readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
        )
    }
}
