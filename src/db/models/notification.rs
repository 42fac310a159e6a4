use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Delivery channel. Stored as TEXT; `as_str` values are the wire format on
/// both the HTTP API and the log topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    PushIos,
    PushAndroid,
    Webhook,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::PushIos => "PUSH_IOS",
            Channel::PushAndroid => "PUSH_ANDROID",
            Channel::Webhook => "WEBHOOK",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "EMAIL" => Some(Channel::Email),
            "SMS" => Some(Channel::Sms),
            "PUSH_IOS" => Some(Channel::PushIos),
            "PUSH_ANDROID" => Some(Channel::PushAndroid),
            "WEBHOOK" => Some(Channel::Webhook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Transactional,
    Marketing,
    Alert,
    Reminder,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Transactional => "TRANSACTIONAL",
            NotificationType::Marketing => "MARKETING",
            NotificationType::Alert => "ALERT",
            NotificationType::Reminder => "REMINDER",
        }
    }

    pub fn parse(s: &str) -> Option<NotificationType> {
        match s {
            "TRANSACTIONAL" => Some(NotificationType::Transactional),
            "MARKETING" => Some(NotificationType::Marketing),
            "ALERT" => Some(NotificationType::Alert),
            "REMINDER" => Some(NotificationType::Reminder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        match s {
            "LOW" => Some(Priority::Low),
            "MEDIUM" => Some(Priority::Medium),
            "HIGH" => Some(Priority::High),
            "URGENT" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

/// Notification lifecycle status.
///
/// Transitions form a DAG; `can_transition_to` is the single source of truth
/// and every repository transition method goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Scheduled,
    Processing,
    Retrying,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Scheduled => "SCHEDULED",
            NotificationStatus::Processing => "PROCESSING",
            NotificationStatus::Retrying => "RETRYING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<NotificationStatus> {
        match s {
            "PENDING" => Some(NotificationStatus::Pending),
            "SCHEDULED" => Some(NotificationStatus::Scheduled),
            "PROCESSING" => Some(NotificationStatus::Processing),
            "RETRYING" => Some(NotificationStatus::Retrying),
            "SENT" => Some(NotificationStatus::Sent),
            "DELIVERED" => Some(NotificationStatus::Delivered),
            "FAILED" => Some(NotificationStatus::Failed),
            "CANCELLED" => Some(NotificationStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::Failed
                | NotificationStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        if self.is_terminal() {
            return false;
        }
        // Any non-terminal state may be cancelled.
        if next == Cancelled {
            return true;
        }
        match (self, next) {
            (Scheduled, Pending) => true,
            (Pending, Processing) => true,
            (Retrying, Processing) => true,
            (Processing, Sent) => true,
            (Processing, Failed) => true,
            (Processing, Retrying) => true,
            (Sent, Delivered) => true,
            (Sent, Failed) => true,
            _ => false,
        }
    }
}

/// The canonical notification record.
///
/// Owned by the store from the moment ingestion commits it; workers hold
/// transient copies and authority returns to the store on every transition.
/// Enum-valued columns are stored as TEXT and exposed through the typed
/// accessors below.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    /// Primary key, stable for the request lifetime.
    pub id: Uuid,

    /// Recipient; determines the log partition.
    pub user_id: String,

    /// Optional tenant scoping.
    pub tenant_id: Option<String>,

    /// One of EMAIL, SMS, PUSH_IOS, PUSH_ANDROID, WEBHOOK.
    pub channel: String,

    /// TRANSACTIONAL / MARKETING / ALERT / REMINDER.
    pub notification_type: String,

    /// LOW / MEDIUM / HIGH / URGENT.
    pub priority: String,

    /// Lifecycle status; see `NotificationStatus`.
    pub status: String,

    /// Opaque channel-specific payload, validated by the adapter.
    pub payload: serde_json::Value,

    /// If set, the notification must not be dispatched before this instant.
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Set iff a provider acknowledged enqueue.
    pub sent_at: Option<DateTime<Utc>>,

    /// Set only on a post-send provider callback.
    pub delivered_at: Option<DateTime<Utc>>,

    pub failed_at: Option<DateTime<Utc>>,

    /// Attempt accounting; `retry_count <= max_retries` always holds.
    pub retry_count: i32,
    pub max_retries: i32,

    /// Last failure cause, if any.
    pub error_message: Option<String>,

    /// Provider-side message id, set on SENT. Status ingress looks rows up
    /// by this value.
    pub provider_message_id: Option<String>,

    /// Unique per accepted request within the dedup TTL.
    pub idempotency_key: String,

    /// Stable id for the whole causal chain.
    pub correlation_id: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    pub fn status(&self) -> Option<NotificationStatus> {
        NotificationStatus::parse(&self.status)
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }
}

/// Status a new notification starts in: SCHEDULED only when the due time is
/// strictly in the future at admission, else it is immediately dispatchable.
pub fn initial_status(
    scheduled_for: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> NotificationStatus {
    match scheduled_for {
        Some(t) if t > now => NotificationStatus::Scheduled,
        _ => NotificationStatus::Pending,
    }
}

/// Data required to persist a new notification. `max_retries` defaults from
/// config when omitted; `status` is derived from `scheduled_for`.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub channel: Channel,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub correlation_id: String,
    pub max_retries: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_allows_happy_path() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Processing));
        assert!(Scheduled.can_transition_to(Pending));
        assert!(Sent.can_transition_to(Failed));
    }

    #[test]
    fn status_dag_rejects_backward_and_skipped_transitions() {
        use NotificationStatus::*;
        assert!(!Sent.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Delivered));
        assert!(!Processing.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn any_non_terminal_state_can_cancel() {
        use NotificationStatus::*;
        for s in [Pending, Scheduled, Processing, Retrying, Sent] {
            assert!(s.can_transition_to(Cancelled), "{s:?} should cancel");
        }
        for s in [Delivered, Failed, Cancelled] {
            assert!(!s.can_transition_to(Cancelled), "{s:?} is terminal");
        }
    }

    #[test]
    fn admission_status_boundary() {
        let now = Utc::now();
        assert_eq!(initial_status(None, now), NotificationStatus::Pending);
        assert_eq!(
            initial_status(Some(now), now),
            NotificationStatus::Pending,
            "due exactly now is dispatchable immediately"
        );
        assert_eq!(
            initial_status(Some(now - chrono::Duration::seconds(1)), now),
            NotificationStatus::Pending
        );
        assert_eq!(
            initial_status(Some(now + chrono::Duration::seconds(10)), now),
            NotificationStatus::Scheduled
        );
    }

    #[test]
    fn channel_wire_names_round_trip() {
        for c in [
            Channel::Email,
            Channel::Sms,
            Channel::PushIos,
            Channel::PushAndroid,
            Channel::Webhook,
        ] {
            assert_eq!(Channel::parse(c.as_str()), Some(c));
        }
        assert_eq!(Channel::parse("CARRIER_PIGEON"), None);
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let v = serde_json::to_value(Channel::PushIos).unwrap();
        assert_eq!(v, serde_json::json!("PUSH_IOS"));
        let s: NotificationStatus = serde_json::from_value(serde_json::json!("PENDING")).unwrap();
        assert_eq!(s, NotificationStatus::Pending);
    }
}
