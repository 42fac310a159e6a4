use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::DedupCache;
use crate::config::Config;
use crate::db::models::{
    Channel, NewNotification, Notification, NotificationType, Priority,
};
use crate::db::repository::{InsertOutcome, NotificationRepository};
use crate::error::{AppError, AppResult};
use crate::kafka::{DispatchMessage, LogProducer};
use crate::metrics;
use crate::providers::validate_payload;

/// Validated submission request. Authentication and rate limiting happened
/// upstream; payload shape is checked here before anything is persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub channel: Channel,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub priority: Option<Priority>,
    pub payload: serde_json::Value,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: String,
    pub correlation_id: String,
}

/// Distinguishes a fresh acceptance (201) from an idempotent replay (200).
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted(SubmitResponse),
    Replayed(SubmitResponse),
}

/// Idempotent admission: dedup probe, durable persist, one publish, ack.
/// Once the insert has committed, nothing on the publish path may fail the
/// request.
pub struct IngestionService {
    pool: PgPool,
    cache: DedupCache,
    producer: LogProducer,
    config: Config,
}

/// Derived key for requests that do not carry one: requests with the same
/// recipient and payload within the same minute dedup to one notification.
pub fn derive_idempotency_key(
    user_id: &str,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> String {
    let minute_bucket = now.timestamp() / 60;
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.update(minute_bucket.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a stored row and a replayed request describe the same submission.
/// Same key with a different body is a conflict, never an overwrite.
pub fn body_matches(row: &Notification, req: &SubmitRequest) -> bool {
    row.user_id == req.user_id
        && row.channel == req.channel.as_str()
        && row.payload == req.payload
}

fn cache_key(idempotency_key: &str) -> String {
    format!("dedup:{idempotency_key}")
}

impl IngestionService {
    pub fn new(
        pool: PgPool,
        cache: DedupCache,
        producer: LogProducer,
        config: Config,
    ) -> IngestionService {
        IngestionService {
            pool,
            cache,
            producer,
            config,
        }
    }

    pub async fn submit(&self, req: SubmitRequest) -> AppResult<SubmitOutcome> {
        if req.user_id.trim().is_empty() {
            metrics::ingest("invalid");
            return Err(AppError::Validation("user_id must not be empty".to_string()));
        }
        if let Err(reason) = validate_payload(req.channel, &req.payload) {
            metrics::ingest("invalid");
            return Err(AppError::Validation(format!(
                "payload does not match channel {}: {reason}",
                req.channel.as_str()
            )));
        }

        let now = Utc::now();
        let idempotency_key = match &req.idempotency_key {
            Some(k) if !k.trim().is_empty() => k.clone(),
            _ => derive_idempotency_key(&req.user_id, &req.payload, now),
        };
        let correlation_id = req
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Cache probe. A hit short-circuits to the stored row with no new
        // publish; cache failures fall through to the store, which is the
        // authoritative guard.
        match self.cache.get(&cache_key(&idempotency_key)).await {
            Ok(Some(stored_id)) => {
                if let Ok(id) = stored_id.parse::<Uuid>() {
                    if let Some(row) = NotificationRepository::find_by_id(&self.pool, id).await? {
                        return self.replay(row, &req);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("Dedup cache probe failed, falling through to store: {:?}", e);
            }
        }

        let new = NewNotification {
            user_id: req.user_id.clone(),
            tenant_id: req.tenant_id.clone(),
            channel: req.channel,
            notification_type: req.notification_type,
            priority: req.priority.unwrap_or(Priority::Medium),
            payload: req.payload.clone(),
            scheduled_for: req.scheduled_for,
            idempotency_key: idempotency_key.clone(),
            correlation_id,
            max_retries: req
                .max_retries
                .unwrap_or(self.config.retry.max_attempts as i32)
                .max(0),
        };

        let row = match self.insert_with_retry(new).await? {
            InsertOutcome::Created(row) => row,
            InsertOutcome::Existing(row) => {
                self.write_cache(&idempotency_key, row.id).await;
                return self.replay(row, &req);
            }
        };

        self.write_cache(&idempotency_key, row.id).await;

        // Publish only immediately-due work; the scheduler advances
        // SCHEDULED rows at their due time.
        if row.status == "PENDING" {
            self.publish_with_fallback(&row).await;
        }

        metrics::ingest("accepted");
        tracing::info!(
            notification_id = %row.id,
            correlation_id = %row.correlation_id,
            channel = %row.channel,
            status = %row.status,
            "Notification accepted"
        );
        Ok(SubmitOutcome::Accepted(SubmitResponse {
            id: row.id,
            status: row.status.clone(),
            correlation_id: row.correlation_id,
        }))
    }

    /// The persist step gets a short in-handler retry budget before the
    /// request surfaces UNAVAILABLE; transient store hiccups should not
    /// bounce submissions the caller will immediately repeat.
    async fn insert_with_retry(&self, new: NewNotification) -> AppResult<InsertOutcome> {
        let mut delay = Duration::from_millis(50);
        let mut last_err: Option<AppError> = None;
        for attempt in 1..=3 {
            match NotificationRepository::insert(&self.pool, new.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ AppError::Database(_)) => {
                    tracing::warn!("Store insert attempt {} failed: {:?}", attempt, e);
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err
            .unwrap_or_else(|| AppError::Unavailable("store unavailable".to_string())))
    }

    fn replay_response(row: &Notification) -> SubmitResponse {
        SubmitResponse {
            id: row.id,
            status: row.status.clone(),
            correlation_id: row.correlation_id.clone(),
        }
    }

    fn replay(&self, row: Notification, req: &SubmitRequest) -> AppResult<SubmitOutcome> {
        if !body_matches(&row, req) {
            metrics::ingest("conflict");
            return Err(AppError::Conflict(format!(
                "idempotency key '{}' was used with a different request body",
                row.idempotency_key
            )));
        }
        metrics::ingest("replayed");
        tracing::debug!(
            notification_id = %row.id,
            "Idempotent replay, returning stored notification"
        );
        Ok(SubmitOutcome::Replayed(Self::replay_response(&row)))
    }

    async fn write_cache(&self, idempotency_key: &str, id: Uuid) {
        // Fire-and-forget-safe: the unique index backs the cache up.
        if let Err(e) = self
            .cache
            .set(
                &cache_key(idempotency_key),
                &id.to_string(),
                self.cache.dedup_ttl,
            )
            .await
        {
            tracing::debug!("Dedup cache write failed: {:?}", e);
        }
    }

    /// The record is already durable; publish errors are absorbed. One
    /// fallback publish goes to the retry topic with a `producer-failure`
    /// header, and past that the scheduler's recovery sweep picks the row up
    /// from the store.
    async fn publish_with_fallback(&self, row: &Notification) {
        let Some(msg) = DispatchMessage::from_notification(row) else {
            tracing::error!(
                notification_id = %row.id,
                "Row carries unknown enum values, cannot build log message"
            );
            return;
        };

        match self.producer.publish_main(&msg).await {
            Ok(_) => {}
            Err(main_err) => {
                tracing::warn!(
                    notification_id = %row.id,
                    correlation_id = %row.correlation_id,
                    "Main topic publish failed, trying retry topic: {}",
                    main_err
                );
                if let Err(retry_err) = self
                    .producer
                    .publish_retry(&msg, Utc::now(), true)
                    .await
                {
                    tracing::error!(
                        notification_id = %row.id,
                        correlation_id = %row.correlation_id,
                        "Fallback publish failed, recovery sweep will republish: {}",
                        retry_err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> SubmitRequest {
        SubmitRequest {
            user_id: "u1".to_string(),
            tenant_id: None,
            channel: Channel::Email,
            notification_type: NotificationType::Transactional,
            priority: None,
            payload: serde_json::json!({"to": "a@b.c", "subject": "hi", "body": "x"}),
            scheduled_for: None,
            idempotency_key: Some("k1".to_string()),
            correlation_id: None,
            max_retries: None,
        }
    }

    fn row_for(req: &SubmitRequest) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            user_id: req.user_id.clone(),
            tenant_id: None,
            channel: req.channel.as_str().to_string(),
            notification_type: req.notification_type.as_str().to_string(),
            priority: "MEDIUM".to_string(),
            status: "PENDING".to_string(),
            payload: req.payload.clone(),
            scheduled_for: None,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            retry_count: 0,
            max_retries: 5,
            error_message: None,
            provider_message_id: None,
            idempotency_key: "k1".to_string(),
            correlation_id: "corr".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn derived_key_is_stable_within_a_minute() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 10).unwrap();
        let payload = serde_json::json!({"to": "a@b.c"});
        let k1 = derive_idempotency_key("u1", &payload, t);
        let k2 = derive_idempotency_key(
            "u1",
            &payload,
            t + chrono::Duration::seconds(40),
        );
        assert_eq!(k1, k2, "same minute bucket");
        assert_eq!(k1.len(), 64, "sha-256 hex");
    }

    #[test]
    fn derived_key_changes_across_minutes_users_and_payloads() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 59).unwrap();
        let payload = serde_json::json!({"to": "a@b.c"});
        let base = derive_idempotency_key("u1", &payload, t);
        assert_ne!(
            base,
            derive_idempotency_key("u1", &payload, t + chrono::Duration::seconds(2))
        );
        assert_ne!(base, derive_idempotency_key("u2", &payload, t));
        assert_ne!(
            base,
            derive_idempotency_key("u1", &serde_json::json!({"to": "x@y.z"}), t)
        );
    }

    #[test]
    fn replay_with_same_body_matches() {
        let req = request();
        let row = row_for(&req);
        assert!(body_matches(&row, &req));
    }

    #[test]
    fn same_key_different_body_is_detected() {
        let req = request();
        let mut row = row_for(&req);
        row.payload = serde_json::json!({"to": "other@b.c", "subject": "hi", "body": "x"});
        assert!(!body_matches(&row, &req));

        let mut row2 = row_for(&req);
        row2.channel = "SMS".to_string();
        assert!(!body_matches(&row2, &req));
    }
}
