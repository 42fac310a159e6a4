use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::repository::{EventRepository, NotificationRepository};
use crate::error::{AppError, AppResult};
use crate::services::ingestion::{SubmitOutcome, SubmitRequest};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(submit_notification))
        .route("/:id", get(get_notification))
}

#[derive(Debug, Serialize)]
pub struct NotificationView {
    pub id: Uuid,
    pub user_id: String,
    pub channel: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub priority: String,
    pub status: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Lifecycle trail, oldest first.
    pub events: Vec<EventView>,
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub event_type: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Submission ingress. 201 on fresh acceptance, 200 on idempotent replay,
/// 409 on same-key-different-body, 400 on validation failure.
async fn submit_notification(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> AppResult<impl IntoResponse> {
    match state.ingestion.submit(req).await? {
        SubmitOutcome::Accepted(resp) => Ok((StatusCode::CREATED, Json(resp))),
        SubmitOutcome::Replayed(resp) => Ok((StatusCode::OK, Json(resp))),
    }
}

/// Status lookup for submitters polling an async dispatch.
async fn get_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<NotificationView>> {
    let row = NotificationRepository::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("notification {id}")))?;
    let events = EventRepository::list_for_notification(&state.db, id)
        .await?
        .into_iter()
        .map(|e| EventView {
            event_type: e.event_type,
            metadata: e.metadata,
            created_at: e.created_at,
        })
        .collect();

    Ok(Json(NotificationView {
        id: row.id,
        user_id: row.user_id,
        channel: row.channel,
        notification_type: row.notification_type,
        priority: row.priority,
        status: row.status,
        scheduled_for: row.scheduled_for,
        sent_at: row.sent_at,
        delivered_at: row.delivered_at,
        failed_at: row.failed_at,
        retry_count: row.retry_count,
        max_retries: row.max_retries,
        error_message: row.error_message,
        correlation_id: row.correlation_id,
        created_at: row.created_at,
        updated_at: row.updated_at,
        events,
    }))
}
