use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::DedupCache;
use crate::config::SchedulerConfig;
use crate::db::models::Notification;
use crate::kafka::{DispatchMessage, LogProducer};

/// Periodic tick with two jobs: advance due SCHEDULED rows to PENDING and
/// publish them, and republish PENDING rows whose ingestion-time publish
/// never happened. Both are batched and bounded per tick.
pub struct Scheduler {
    pool: PgPool,
    cache: DedupCache,
    producer: LogProducer,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        cache: DedupCache,
        producer: LogProducer,
        config: SchedulerConfig,
    ) -> Scheduler {
        Scheduler {
            pool,
            cache,
            producer,
            config,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tick = Duration::from_millis(self.config.tick_ms);
            tracing::info!("Scheduler started, tick every {} ms", self.config.tick_ms);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("Scheduler shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(tick) => {
                        self.run_tick().await;
                    }
                }
            }
        })
    }

    async fn run_tick(&self) {
        if let Err(e) = self.advance_due().await {
            tracing::warn!("Scheduler advance pass failed: {:?}", e);
        }
        if let Err(e) = self.recover_stuck().await {
            tracing::warn!("Scheduler recovery sweep failed: {:?}", e);
        }
    }

    /// SCHEDULED rows whose due time has arrived become PENDING and get
    /// published. The row transition happens first; a publish failure leaves
    /// a PENDING row for the recovery sweep.
    async fn advance_due(&self) -> crate::error::AppResult<()> {
        let due = crate::db::repository::NotificationRepository::advance_due_scheduled(
            &self.pool,
            Utc::now(),
            self.config.batch_size,
        )
        .await?;

        if due.is_empty() {
            return Ok(());
        }
        tracing::info!("Advancing {} due scheduled notifications", due.len());
        for row in &due {
            self.publish(row).await;
            metrics::counter!(crate::metrics::SCHEDULER_ADVANCED_TOTAL).increment(1);
        }
        Ok(())
    }

    /// PENDING rows older than the threshold never made it onto the log
    /// (ingestion publish failed and so did its fallback). Republish them,
    /// guarded by a short-TTL lock so concurrent schedulers do not double
    /// publish. The worker's claim CAS defuses the remaining race.
    async fn recover_stuck(&self) -> crate::error::AppResult<()> {
        let threshold = Utc::now() - chrono::Duration::seconds(self.config.stuck_after_s);
        let stuck = crate::db::repository::NotificationRepository::find_stuck_pending(
            &self.pool,
            threshold,
            self.config.batch_size,
        )
        .await?;

        for row in &stuck {
            let lock_key = format!("scheduler:republish:{}", row.id);
            match self
                .cache
                .setnx(&lock_key, "1", Duration::from_secs(self.config.lock_ttl_s))
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    // Lock unavailable: republishing anyway risks a duplicate
                    // message, which the worker's idempotency re-check and
                    // claim CAS absorb.
                    tracing::debug!("Republish lock unavailable, continuing: {:?}", e);
                }
            }
            tracing::warn!(
                notification_id = %row.id,
                correlation_id = %row.correlation_id,
                "Republishing stuck PENDING notification"
            );
            self.publish(row).await;
            metrics::counter!(crate::metrics::SCHEDULER_RECOVERED_TOTAL).increment(1);
        }
        Ok(())
    }

    async fn publish(&self, row: &Notification) {
        let Some(msg) = DispatchMessage::from_notification(row) else {
            tracing::error!(
                notification_id = %row.id,
                "Row carries unknown enum values, cannot build log message"
            );
            return;
        };
        if let Err(e) = self.producer.publish_main(&msg).await {
            tracing::warn!(
                notification_id = %row.id,
                "Scheduler publish failed, next tick retries: {}",
                e
            );
        }
    }
}
