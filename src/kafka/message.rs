use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::{Channel, Notification, NotificationType, Priority};

/// Main work queue. Key = `user_id`, so one user's notifications land on one
/// partition and stay ordered.
pub const TOPIC_MAIN: &str = "notifications";
/// Delayed retries, gated by the `delivery-not-before` header.
pub const TOPIC_RETRY: &str = "notifications.retry";
/// Terminal failures; never auto-drained.
pub const TOPIC_DLQ: &str = "notifications.dlq";

pub const SCHEMA_VERSION: i32 = 1;

pub const HEADER_SCHEMA_VERSION: &str = "schema_version";
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency_key";
pub const HEADER_PRIORITY: &str = "priority";
pub const HEADER_RETRY_COUNT: &str = "retry_count";
/// RFC 3339 instant before which a retry-topic message must not dispatch.
pub const HEADER_NOT_BEFORE: &str = "delivery-not-before";
/// Marks a fallback publish made after the main-topic publish failed.
pub const HEADER_PRODUCER_FAILURE: &str = "producer-failure";

/// The log message body, shared by all three topics.
///
/// `retry_count` lets the consumer distinguish fresh work from a retry
/// without a store round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub id: Uuid,
    pub schema_version: i32,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub channel: Channel,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub correlation_id: String,
    pub idempotency_key: String,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_deadline: Option<DateTime<Utc>>,
}

impl DispatchMessage {
    /// Build the log representation of a stored notification. Returns `None`
    /// when the row carries enum values this schema version does not know.
    pub fn from_notification(n: &Notification) -> Option<DispatchMessage> {
        Some(DispatchMessage {
            id: n.id,
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            user_id: n.user_id.clone(),
            tenant_id: n.tenant_id.clone(),
            channel: Channel::parse(&n.channel)?,
            notification_type: NotificationType::parse(&n.notification_type)?,
            priority: Priority::parse(&n.priority)?,
            payload: n.payload.clone(),
            scheduled_for: n.scheduled_for,
            correlation_id: n.correlation_id.clone(),
            idempotency_key: n.idempotency_key.clone(),
            retry_count: n.retry_count,
            attempt_deadline: None,
        })
    }
}

/// Envelope for DLQ admissions. Wraps the original message with the failure
/// context an operator needs to decide on a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_message: DispatchMessage,
    pub error_kind: String,
    pub error_message: String,
    /// One of `permanent_error`, `max_retries_exceeded`, `retry_enqueue_failed`.
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: i32,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DispatchMessage {
        DispatchMessage {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            user_id: "u1".to_string(),
            tenant_id: None,
            channel: Channel::Email,
            notification_type: NotificationType::Transactional,
            priority: Priority::High,
            payload: serde_json::json!({"to": "a@b.c", "subject": "hi", "body": "x"}),
            scheduled_for: None,
            correlation_id: "corr-1".to_string(),
            idempotency_key: "k1".to_string(),
            retry_count: 0,
            attempt_deadline: None,
        }
    }

    #[test]
    fn body_uses_wire_field_names() {
        let v = serde_json::to_value(sample()).unwrap();
        assert_eq!(v["channel"], "EMAIL");
        assert_eq!(v["type"], "TRANSACTIONAL");
        assert_eq!(v["priority"], "HIGH");
        assert!(v.get("tenant_id").is_none(), "absent optionals are omitted");
    }

    #[test]
    fn body_round_trips_through_json() {
        let msg = sample();
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: DispatchMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.retry_count, 0);
        assert_eq!(back.channel, Channel::Email);
    }
}
