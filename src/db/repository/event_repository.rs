use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::models::{EventType, NotificationEvent};
use crate::error::AppResult;

/// Repository for the append-only lifecycle event log.
pub struct EventRepository;

impl EventRepository {
    /// Append an event inside an open transaction. Used by every status
    /// transition so the event log stays a faithful projection of state.
    pub async fn append_tx(
        tx: &mut Transaction<'_, Postgres>,
        notification_id: Uuid,
        event_type: EventType,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_events (id, notification_id, event_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification_id)
        .bind(event_type.as_str())
        .bind(metadata)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Lifecycle trail for one notification, oldest first.
    pub async fn list_for_notification(
        pool: &PgPool,
        notification_id: Uuid,
    ) -> AppResult<Vec<NotificationEvent>> {
        let rows = sqlx::query_as::<_, NotificationEvent>(
            r#"
            SELECT id, notification_id, event_type, metadata, created_at
            FROM notification_events
            WHERE notification_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
