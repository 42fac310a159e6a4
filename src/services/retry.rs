use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;

use crate::config::RetryConfig;
use crate::db::repository::NotificationRepository;
use crate::error::AppResult;
use crate::kafka::{DeadLetterMessage, DispatchMessage, LogProducer};
use crate::metrics;
use crate::providers::{ErrorKind, ProviderError};

pub const REASON_PERMANENT: &str = "permanent_error";
pub const REASON_MAX_RETRIES: &str = "max_retries_exceeded";
pub const REASON_ENQUEUE_FAILED: &str = "retry_enqueue_failed";

/// Where a failed message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Published to the retry topic, not to be dispatched before the instant.
    Retried { delay: Duration },
    /// Admitted to the DLQ with the given reason; the row is FAILED.
    DeadLettered { reason: &'static str },
}

/// Position of the failed message in the log, carried into the DLQ envelope.
#[derive(Debug, Clone, Copy)]
pub struct LogPosition<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
}

/// Routes failed dispatches: permanent errors and exhausted attempts go to
/// the DLQ, everything else to the retry topic with exponential backoff.
/// Also reconciles the notification row, so a DLQ admission and the FAILED
/// status never diverge.
pub struct RetryRouter {
    pool: PgPool,
    producer: LogProducer,
    config: RetryConfig,
}

impl RetryRouter {
    pub fn new(pool: PgPool, producer: LogProducer, config: RetryConfig) -> RetryRouter {
        RetryRouter {
            pool,
            producer,
            config,
        }
    }

    /// Deterministic backoff for the given attempt: `base_delay × 2^n`,
    /// capped at `max_delay_ms`.
    pub fn backoff_delay(config: &RetryConfig, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 31) as u32;
        let delay_ms = config
            .base_delay_ms
            .saturating_mul(1u64 << exp.min(20))
            .min(config.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Uniform jitter in `[0, delay/2)`, added so a common outage does not
    /// produce a thundering herd when it clears.
    pub fn with_jitter(delay: Duration) -> Duration {
        let half = delay.as_millis() as u64 / 2;
        if half == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..half);
        delay + Duration::from_millis(jitter)
    }

    /// Route one failed dispatch. `max_retries` is the per-notification
    /// budget read from the row by the caller.
    pub async fn route(
        &self,
        msg: &DispatchMessage,
        error: &ProviderError,
        max_retries: i32,
        position: LogPosition<'_>,
    ) -> AppResult<RouteOutcome> {
        if error.kind == ErrorKind::Permanent {
            self.dead_letter(msg, error, REASON_PERMANENT, position)
                .await?;
            return Ok(RouteOutcome::DeadLettered {
                reason: REASON_PERMANENT,
            });
        }

        let next_attempt = msg.retry_count + 1;
        if next_attempt > max_retries {
            self.dead_letter(msg, error, REASON_MAX_RETRIES, position)
                .await?;
            return Ok(RouteOutcome::DeadLettered {
                reason: REASON_MAX_RETRIES,
            });
        }

        let delay = Self::with_jitter(Self::backoff_delay(&self.config, msg.retry_count));
        let not_before = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));

        // The row transition comes first: if the process dies between the
        // update and the publish, the recovery path still sees RETRYING with
        // an accurate attempt count.
        NotificationRepository::mark_retrying(&self.pool, msg.id, next_attempt, &error.message)
            .await?;

        let mut retry_msg = msg.clone();
        retry_msg.retry_count = next_attempt;
        retry_msg.timestamp = Utc::now();

        match self
            .producer
            .publish_retry(&retry_msg, not_before, false)
            .await
        {
            Ok(_) => {
                metrics::retry_enqueued();
                tracing::info!(
                    notification_id = %msg.id,
                    correlation_id = %msg.correlation_id,
                    retry_count = next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Dispatch failed, retry enqueued"
                );
                Ok(RouteOutcome::Retried { delay })
            }
            Err(e) => {
                // The retry must never vanish: failing to enqueue it is
                // itself terminal.
                tracing::error!(
                    notification_id = %msg.id,
                    correlation_id = %msg.correlation_id,
                    "Retry publish failed, dead-lettering: {}",
                    e
                );
                let enqueue_error = ProviderError::transient(format!(
                    "{} (retry publish failed: {})",
                    error.message, e
                ));
                self.dead_letter(&retry_msg, &enqueue_error, REASON_ENQUEUE_FAILED, position)
                    .await?;
                Ok(RouteOutcome::DeadLettered {
                    reason: REASON_ENQUEUE_FAILED,
                })
            }
        }
    }

    async fn dead_letter(
        &self,
        msg: &DispatchMessage,
        error: &ProviderError,
        reason: &'static str,
        position: LogPosition<'_>,
    ) -> AppResult<()> {
        let dead = DeadLetterMessage {
            original_message: msg.clone(),
            error_kind: error.kind.as_str().to_string(),
            error_message: error.message.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
            retry_count: msg.retry_count,
            topic: position.topic.to_string(),
            partition: position.partition,
            offset: position.offset,
        };

        if let Err(e) = self.producer.publish_dlq(&dead).await {
            // Nothing left to route to; the FAILED row plus this log line is
            // the remaining trace.
            tracing::error!(
                notification_id = %msg.id,
                correlation_id = %msg.correlation_id,
                "DLQ publish failed: {}",
                e
            );
        }

        NotificationRepository::mark_failed(&self.pool, msg.id, &error.message, true).await?;
        metrics::dlq(reason);
        tracing::warn!(
            notification_id = %msg.id,
            correlation_id = %msg.correlation_id,
            reason,
            "Notification dead-lettered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = config();
        let schedule: Vec<u64> = (0..5)
            .map(|n| RetryRouter::backoff_delay(&cfg, n).as_secs())
            .collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let cfg = config();
        assert_eq!(
            RetryRouter::backoff_delay(&cfg, 10),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            RetryRouter::backoff_delay(&cfg, 1_000),
            Duration::from_millis(60_000),
            "huge attempt counts must not overflow"
        );
    }

    #[test]
    fn jitter_stays_within_half_delay() {
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let jittered = RetryRouter::with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered < base + Duration::from_secs(2));
        }
    }

    #[test]
    fn jitter_of_zero_delay_is_identity() {
        assert_eq!(
            RetryRouter::with_jitter(Duration::ZERO),
            Duration::ZERO
        );
    }
}
