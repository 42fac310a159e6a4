use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{initial_status, EventType, NewNotification, Notification};
use crate::db::repository::EventRepository;
use crate::error::AppResult;

const COLUMNS: &str = "id, user_id, tenant_id, channel, notification_type, priority, status, \
     payload, scheduled_for, sent_at, delivered_at, failed_at, retry_count, max_retries, \
     error_message, provider_message_id, idempotency_key, correlation_id, created_at, updated_at";

/// Outcome of an idempotent insert.
#[derive(Debug)]
pub enum InsertOutcome {
    /// A fresh row was committed.
    Created(Notification),
    /// The idempotency key already had a row; the stored one is returned.
    Existing(Notification),
}

/// Repository for the canonical notification records.
///
/// Implementation notes:
/// - Status transitions are conditional single-statement UPDATEs whose WHERE
///   clause encodes the legal prior states, so a lost CAS shows up as zero
///   rows updated rather than a corrupted transition.
/// - Every transition writes its lifecycle event in the same transaction.
pub struct NotificationRepository;

impl NotificationRepository {
    /// Insert a new notification guarded by the unique idempotency index.
    ///
    /// On index conflict the existing row is recovered and returned; the
    /// caller decides whether the replay body matches. The CREATED event is
    /// only written for fresh rows.
    pub async fn insert(pool: &PgPool, new: NewNotification) -> AppResult<InsertOutcome> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let status = initial_status(new.scheduled_for, now);

        let mut tx = pool.begin().await?;

        let inserted = sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notifications (
                id, user_id, tenant_id, channel, notification_type, priority, status,
                payload, scheduled_for, retry_count, max_retries,
                idempotency_key, correlation_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11, $12, $13, $13)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&new.user_id)
        .bind(&new.tenant_id)
        .bind(new.channel.as_str())
        .bind(new.notification_type.as_str())
        .bind(new.priority.as_str())
        .bind(status.as_str())
        .bind(&new.payload)
        .bind(new.scheduled_for)
        .bind(new.max_retries)
        .bind(&new.idempotency_key)
        .bind(&new.correlation_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some(row) => {
                EventRepository::append_tx(&mut tx, row.id, EventType::Created, None).await?;
                tx.commit().await?;
                Ok(InsertOutcome::Created(row))
            }
            None => {
                tx.rollback().await?;
                let existing = Self::find_by_idempotency_key(pool, &new.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        crate::error::AppError::Internal(anyhow::anyhow!(
                            "idempotency conflict but no row for key"
                        ))
                    })?;
                Ok(InsertOutcome::Existing(existing))
            }
        }
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> AppResult<Option<Notification>> {
        let row = sqlx::query_as::<_, Notification>(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_idempotency_key(
        pool: &PgPool,
        key: &str,
    ) -> AppResult<Option<Notification>> {
        let row = sqlx::query_as::<_, Notification>(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_provider_message_id(
        pool: &PgPool,
        provider_message_id: &str,
    ) -> AppResult<Option<Notification>> {
        let row = sqlx::query_as::<_, Notification>(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE provider_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// CAS PENDING/RETRYING -> PROCESSING. Returns `None` when another
    /// worker already owns the row (or it moved to a terminal state); the
    /// caller must not dispatch after a `None`.
    pub async fn claim_for_processing(pool: &PgPool, id: Uuid) -> AppResult<Option<Notification>> {
        let mut tx = pool.begin().await?;
        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'PROCESSING', updated_at = now()
            WHERE id = $1 AND status IN ('PENDING', 'RETRYING')
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(ref n) = row {
            EventRepository::append_tx(&mut tx, n.id, EventType::Processing, None).await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(row)
    }

    /// PROCESSING -> SENT with `sent_at` and the provider's message id.
    pub async fn mark_sent(
        pool: &PgPool,
        id: Uuid,
        provider_message_id: &str,
    ) -> AppResult<Option<Notification>> {
        let mut tx = pool.begin().await?;
        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'SENT', sent_at = now(), provider_message_id = $2, updated_at = now()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(provider_message_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(ref n) = row {
            EventRepository::append_tx(
                &mut tx,
                n.id,
                EventType::Sent,
                Some(serde_json::json!({ "provider_message_id": provider_message_id })),
            )
            .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(row)
    }

    /// PROCESSING -> RETRYING with the bumped attempt count. The update
    /// refuses to push `retry_count` past `max_retries`.
    pub async fn mark_retrying(
        pool: &PgPool,
        id: Uuid,
        retry_count: i32,
        error_message: &str,
    ) -> AppResult<Option<Notification>> {
        let mut tx = pool.begin().await?;
        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'RETRYING', retry_count = $2, error_message = $3, updated_at = now()
            WHERE id = $1 AND status = 'PROCESSING' AND $2 <= max_retries
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(retry_count)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(ref n) = row {
            EventRepository::append_tx(
                &mut tx,
                n.id,
                EventType::Retrying,
                Some(serde_json::json!({ "retry_count": retry_count, "error": error_message })),
            )
            .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(row)
    }

    /// PROCESSING/SENT -> FAILED (terminal) with `failed_at` and the cause.
    pub async fn mark_failed(
        pool: &PgPool,
        id: Uuid,
        error_message: &str,
        dead_lettered: bool,
    ) -> AppResult<Option<Notification>> {
        let mut tx = pool.begin().await?;
        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'FAILED', failed_at = now(), error_message = $2, updated_at = now()
            WHERE id = $1 AND status IN ('PROCESSING', 'SENT')
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error_message)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(ref n) = row {
            EventRepository::append_tx(
                &mut tx,
                n.id,
                EventType::Failed,
                Some(serde_json::json!({ "error": error_message })),
            )
            .await?;
            if dead_lettered {
                EventRepository::append_tx(&mut tx, n.id, EventType::DeadLettered, None).await?;
            }
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(row)
    }

    /// SENT -> DELIVERED on a provider callback.
    pub async fn mark_delivered(pool: &PgPool, id: Uuid) -> AppResult<Option<Notification>> {
        let mut tx = pool.begin().await?;
        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'DELIVERED', delivered_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'SENT'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(ref n) = row {
            EventRepository::append_tx(&mut tx, n.id, EventType::Delivered, None).await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(row)
    }

    /// Advance due SCHEDULED rows to PENDING, bounded per tick. `FOR UPDATE
    /// SKIP LOCKED` keeps concurrent schedulers from fighting over rows.
    pub async fn advance_due_scheduled(
        pool: &PgPool,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let mut tx = pool.begin().await?;
        let rows = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'PENDING', updated_at = now()
            WHERE id IN (
                SELECT id FROM notifications
                WHERE status = 'SCHEDULED' AND scheduled_for <= $1
                ORDER BY scheduled_for ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for n in &rows {
            EventRepository::append_tx(&mut tx, n.id, EventType::Published, None).await?;
        }
        tx.commit().await?;
        Ok(rows)
    }

    /// PENDING rows untouched for longer than the threshold. These failed to
    /// publish during ingestion and need the recovery sweep.
    pub async fn find_stuck_pending(
        pool: &PgPool,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE status = 'PENDING' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
