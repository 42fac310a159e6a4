use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle event kind, one per status transition plus CREATED and
/// DEAD_LETTERED markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Published,
    Processing,
    Sent,
    Delivered,
    Failed,
    Retrying,
    Cancelled,
    DeadLettered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Published => "PUBLISHED",
            EventType::Processing => "PROCESSING",
            EventType::Sent => "SENT",
            EventType::Delivered => "DELIVERED",
            EventType::Failed => "FAILED",
            EventType::Retrying => "RETRYING",
            EventType::Cancelled => "CANCELLED",
            EventType::DeadLettered => "DEAD_LETTERED",
        }
    }
}

/// Append-only lifecycle record. Created in the same transaction as the
/// notification update it describes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub event_type: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
