use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod callbacks;
pub mod health;
pub mod notifications;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health probes
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // Submission ingress
        .nest("/api/notifications", notifications::router())
        // Provider status ingress
        .nest("/callbacks", callbacks::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
