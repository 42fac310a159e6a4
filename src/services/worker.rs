use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use rdkafka::message::Message;
use sqlx::PgPool;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::models::{Channel, Notification};
use crate::db::repository::NotificationRepository;
use crate::error::AppResult;
use crate::kafka::{DispatchMessage, LogConsumer, LogProducer, TOPIC_RETRY};
use crate::metrics;
use crate::providers::{
    AdapterPair, AdapterRegistry, DispatchContext, ErrorKind, ProviderAck, ProviderAdapter,
    ProviderError,
};
use crate::services::breaker::{BreakerRegistry, CircuitState};
use crate::services::retry::{LogPosition, RetryRouter};

/// Pause after republishing a not-yet-due retry message, so a nearly-empty
/// retry partition does not spin.
const RETRY_REQUEUE_PAUSE: Duration = Duration::from_millis(200);

/// Consumes the main and retry topics and drives each message through the
/// dispatch state machine.
///
/// Each consumer task owns one consumer in the group and processes its
/// assigned partitions serially; an offset is committed only after the
/// terminal step for that message, so a crash redelivers instead of losing
/// work. The shared semaphore bounds in-flight dispatches per process.
pub struct DeliveryWorker {
    pool: PgPool,
    producer: LogProducer,
    adapters: AdapterRegistry,
    breakers: Arc<BreakerRegistry>,
    router: Arc<RetryRouter>,
    config: Arc<Config>,
    permits: Arc<Semaphore>,
    inflight: Arc<AtomicUsize>,
}

impl DeliveryWorker {
    pub fn new(
        pool: PgPool,
        producer: LogProducer,
        adapters: AdapterRegistry,
        breakers: Arc<BreakerRegistry>,
        router: Arc<RetryRouter>,
        config: Arc<Config>,
    ) -> DeliveryWorker {
        let pool_size = config.worker.dispatch_pool as usize;
        DeliveryWorker {
            pool,
            producer,
            adapters,
            breakers,
            router,
            config,
            permits: Arc::new(Semaphore::new(pool_size)),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count of dispatches currently in flight; the supervisor polls this
    /// during drain.
    pub fn inflight_counter(&self) -> Arc<AtomicUsize> {
        self.inflight.clone()
    }

    /// Spawn the configured number of consumer tasks.
    pub fn spawn_consumers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.config.worker.consumers)
            .map(|index| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.run_consumer(index, shutdown).await;
                })
            })
            .collect()
    }

    async fn run_consumer(self: Arc<Self>, index: u32, mut shutdown: watch::Receiver<bool>) {
        let consumer = match LogConsumer::new(
            &self.config.kafka,
            &[crate::kafka::TOPIC_MAIN, TOPIC_RETRY],
        ) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Delivery consumer {} failed to start: {}", index, e);
                return;
            }
        };
        tracing::info!("Delivery consumer {} started", index);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Delivery consumer {} stopping fetch", index);
                        break;
                    }
                }
                received = consumer.recv() => match received {
                    Ok(msg) => self.handle_message(&consumer, &msg).await,
                    Err(e) => {
                        tracing::warn!("Delivery consumer {} poll error: {}", index, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    async fn handle_message(&self, consumer: &LogConsumer, msg: &rdkafka::message::BorrowedMessage<'_>) {
        let Some(parsed) = LogConsumer::parse(msg) else {
            // Undecodable messages cannot be routed anywhere useful; ack so
            // the partition is not wedged.
            if let Err(e) = consumer.commit(msg) {
                tracing::warn!("Offset commit failed: {}", e);
            }
            return;
        };

        // Retry-topic gate: before the header instant, the message goes
        // back on the topic untouched.
        if msg.topic() == TOPIC_RETRY {
            if let Some(not_before) = LogConsumer::delivery_not_before(msg) {
                if not_before > Utc::now() {
                    match self.producer.publish_retry(&parsed, not_before, false).await {
                        Ok(_) => {
                            if let Err(e) = consumer.commit(msg) {
                                tracing::warn!("Offset commit failed: {}", e);
                            }
                            tokio::time::sleep(RETRY_REQUEUE_PAUSE).await;
                        }
                        Err(e) => {
                            // Leave uncommitted; redelivery keeps the message.
                            tracing::error!(
                                notification_id = %parsed.id,
                                "Requeue of delayed retry failed: {}",
                                e
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                    return;
                }
            }
        }

        let position = LogPosition {
            topic: msg.topic(),
            partition: msg.partition(),
            offset: msg.offset(),
        };

        match self.process(&parsed, position).await {
            Ok(()) => {
                if let Err(e) = consumer.commit(msg) {
                    tracing::warn!("Offset commit failed: {}", e);
                }
            }
            Err(e) => {
                // Store or log unavailable mid-message: do not commit, let
                // the redelivery retry after a pause.
                tracing::error!(
                    notification_id = %parsed.id,
                    correlation_id = %parsed.correlation_id,
                    "Message processing failed, leaving uncommitted: {:?}",
                    e
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// The per-message state machine. Every exit of this function is a
    /// terminal step for the message and allows the offset commit.
    async fn process(&self, msg: &DispatchMessage, position: LogPosition<'_>) -> AppResult<()> {
        // Idempotency re-check: re-read the row before any dispatch. This is
        // the guard against redelivery after a crash between dispatch and
        // offset commit.
        let Some(row) = NotificationRepository::find_by_id(&self.pool, msg.id).await? else {
            tracing::warn!(notification_id = %msg.id, "Log message for unknown notification");
            return Ok(());
        };

        if row.sent_at.is_some() || row.status().map(|s| s.is_terminal()).unwrap_or(false) {
            tracing::debug!(
                notification_id = %row.id,
                status = %row.status,
                "Already handled, dropping redelivered message"
            );
            metrics::dispatch(&row.channel, "dropped");
            return Ok(());
        }

        // Schedule re-check: not due yet, push it out with a delay.
        if let Some(at) = row.scheduled_for {
            if at > Utc::now() {
                if let Err(e) = self.producer.publish_retry(msg, at, false).await {
                    tracing::warn!(
                        notification_id = %row.id,
                        "Deferred republish failed, scheduler sweep will recover: {}",
                        e
                    );
                }
                return Ok(());
            }
        }

        // CAS PENDING/RETRYING -> PROCESSING; a lost CAS means another
        // worker owns the message and we must not dispatch.
        let Some(claimed) = NotificationRepository::claim_for_processing(&self.pool, msg.id).await?
        else {
            tracing::debug!(notification_id = %msg.id, "Claim lost, dropping");
            metrics::dispatch(&row.channel, "dropped");
            return Ok(());
        };

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let inflight = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::inflight(inflight);

        let result = self.dispatch_guarded(&claimed).await;

        let inflight = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::inflight(inflight);

        match result {
            Ok(ack) => {
                if NotificationRepository::mark_sent(
                    &self.pool,
                    claimed.id,
                    &ack.provider_message_id,
                )
                .await?
                .is_none()
                {
                    tracing::warn!(
                        notification_id = %claimed.id,
                        "SENT transition refused; row moved underneath the dispatch"
                    );
                }
                metrics::dispatch(&claimed.channel, "sent");
                tracing::info!(
                    notification_id = %claimed.id,
                    correlation_id = %claimed.correlation_id,
                    provider_message_id = %ack.provider_message_id,
                    "Dispatch acknowledged"
                );
            }
            Err(err) => {
                let outcome = match err.kind {
                    ErrorKind::Transient => "transient_error",
                    ErrorKind::Permanent => "permanent_error",
                    ErrorKind::Timeout => "timeout",
                };
                metrics::dispatch(&claimed.channel, outcome);
                self.router
                    .route(msg, &err, claimed.max_retries, position)
                    .await?;
            }
        }
        Ok(())
    }

    fn dispatch_timeout(&self, channel: Channel) -> Duration {
        let ms = match channel {
            Channel::Email => self.config.dispatch.email_timeout_ms,
            Channel::Sms => self.config.dispatch.sms_timeout_ms,
            Channel::PushIos | Channel::PushAndroid => self.config.dispatch.push_timeout_ms,
            Channel::Webhook => self.config.dispatch.webhook_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    async fn dispatch_guarded(&self, row: &Notification) -> Result<ProviderAck, ProviderError> {
        let Some(channel) = row.channel() else {
            return Err(ProviderError::permanent(format!(
                "unknown channel value '{}'",
                row.channel
            )));
        };
        let Some(pair) = self.adapters.get(channel) else {
            return Err(ProviderError::permanent(format!(
                "no adapter configured for channel {}",
                channel.as_str()
            )));
        };
        let ctx = DispatchContext {
            notification_id: row.id,
            channel,
            payload: row.payload.clone(),
            correlation_id: row.correlation_id.clone(),
        };
        dispatch_with_breaker(&self.breakers, pair, &ctx, self.dispatch_timeout(channel)).await
    }
}

/// One attempt against one adapter: panic containment, the adapter-level
/// deadline, and nothing else. A panic inside an adapter is a bug, never a
/// reason to kill the consumer task.
async fn dispatch_once(
    adapter: &dyn ProviderAdapter,
    ctx: &DispatchContext,
    timeout: Duration,
) -> Result<ProviderAck, ProviderError> {
    let guarded = std::panic::AssertUnwindSafe(adapter.dispatch(ctx)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Err(_) => Err(ProviderError::timeout(format!(
            "dispatch via {} exceeded {} ms",
            adapter.name(),
            timeout.as_millis()
        ))),
        Ok(Err(_panic)) => {
            tracing::error!(
                notification_id = %ctx.notification_id,
                correlation_id = %ctx.correlation_id,
                adapter = adapter.name(),
                "Adapter panicked during dispatch"
            );
            Err(ProviderError::transient(format!(
                "unclassified panic in adapter {}",
                adapter.name()
            )))
        }
        Ok(Ok(result)) => result,
    }
}

/// Dispatch through the primary adapter guarded by its breaker, with one
/// fallback attempt when the primary's circuit is open and the failure is
/// retryable.
///
/// Breaker accounting: acks and permanent rejections both prove the provider
/// is alive and count as successes; transient failures and timeouts count as
/// failures. Fail-fast from an open circuit produces a synthetic retryable
/// error without touching the provider.
pub async fn dispatch_with_breaker(
    breakers: &BreakerRegistry,
    pair: &AdapterPair,
    ctx: &DispatchContext,
    timeout: Duration,
) -> Result<ProviderAck, ProviderError> {
    let primary_name = pair.primary.name().to_string();

    let primary_result = if breakers.try_acquire(&primary_name) {
        let result = dispatch_once(pair.primary.as_ref(), ctx, timeout).await;
        match &result {
            Ok(_) => breakers.record_success(&primary_name),
            Err(e) if e.kind == ErrorKind::Permanent => breakers.record_success(&primary_name),
            Err(_) => breakers.record_failure(&primary_name),
        }
        result
    } else {
        Err(ProviderError::transient(format!(
            "circuit open for {primary_name}"
        )))
    };

    match primary_result {
        Ok(ack) => Ok(ack),
        Err(err) if err.retryable && breakers.state(&primary_name) == CircuitState::Open => {
            let Some(fallback) = &pair.fallback else {
                return Err(err);
            };
            let fallback_name = fallback.name().to_string();
            if !breakers.try_acquire(&fallback_name) {
                return Err(err);
            }
            tracing::info!(
                notification_id = %ctx.notification_id,
                fallback = %fallback_name,
                "Primary circuit open, trying fallback once"
            );
            let result = dispatch_once(fallback.as_ref(), ctx, timeout).await;
            match &result {
                Ok(_) => breakers.record_success(&fallback_name),
                Err(e) if e.kind == ErrorKind::Permanent => breakers.record_success(&fallback_name),
                Err(_) => breakers.record_failure(&fallback_name),
            }
            result
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::providers::{MockAdapter, MockOutcome};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn breakers(threshold: u32) -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown_ms: 30_000,
            success_threshold: 2,
        })
    }

    fn ctx() -> DispatchContext {
        DispatchContext {
            notification_id: Uuid::new_v4(),
            channel: Channel::Email,
            payload: serde_json::json!({"to": "a@b.c", "subject": "s", "body": "b"}),
            correlation_id: "corr".to_string(),
        }
    }

    fn pair(primary: Arc<MockAdapter>, fallback: Option<Arc<MockAdapter>>) -> AdapterPair {
        AdapterPair {
            primary,
            fallback: fallback.map(|f| f as Arc<dyn ProviderAdapter>),
        }
    }

    #[tokio::test]
    async fn ack_flows_through() {
        let primary = Arc::new(MockAdapter::new("email.primary").script([MockOutcome::Ack(
            "m-1".to_string(),
        )]));
        let registry = breakers(5);
        let ack = dispatch_with_breaker(
            &registry,
            &pair(primary.clone(), None),
            &ctx(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(ack.provider_message_id, "m-1");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling_the_adapter() {
        let primary = Arc::new(MockAdapter::new("email.primary").script(
            std::iter::repeat_with(|| MockOutcome::Transient("down".to_string()))
                .take(5)
                .collect::<Vec<_>>(),
        ));
        let registry = breakers(5);
        let p = pair(primary.clone(), None);

        for _ in 0..5 {
            let r = dispatch_with_breaker(&registry, &p, &ctx(), Duration::from_secs(1)).await;
            assert!(r.is_err());
        }
        assert_eq!(registry.state("email.primary"), CircuitState::Open);
        assert_eq!(primary.call_count(), 5);

        let r = dispatch_with_breaker(&registry, &p, &ctx(), Duration::from_secs(1)).await;
        let err = r.unwrap_err();
        assert!(err.retryable, "fail-fast error is retryable");
        assert_eq!(primary.call_count(), 5, "no sixth provider call");
    }

    #[tokio::test]
    async fn fallback_is_tried_once_when_primary_circuit_opens() {
        let primary = Arc::new(MockAdapter::new("email.primary").script([MockOutcome::Transient(
            "down".to_string(),
        )]));
        let fallback = Arc::new(MockAdapter::new("email.fallback").script([MockOutcome::Ack(
            "fb-1".to_string(),
        )]));
        // Threshold 1: the single transient failure opens the circuit,
        // enabling the fallback path in the same dispatch.
        let registry = breakers(1);

        let ack = dispatch_with_breaker(
            &registry,
            &pair(primary.clone(), Some(fallback.clone())),
            &ctx(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(ack.provider_message_id, "fb-1");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_trip_the_breaker() {
        let primary = Arc::new(MockAdapter::new("email.primary").script(
            std::iter::repeat_with(|| MockOutcome::Permanent("bad address".to_string()))
                .take(6)
                .collect::<Vec<_>>(),
        ));
        let registry = breakers(5);
        let p = pair(primary.clone(), None);

        for _ in 0..6 {
            let err = dispatch_with_breaker(&registry, &p, &ctx(), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Permanent);
        }
        assert_eq!(registry.state("email.primary"), CircuitState::Closed);
        assert_eq!(primary.call_count(), 6, "provider keeps being called");
    }

    struct SlowAdapter;

    #[async_trait]
    impl ProviderAdapter for SlowAdapter {
        fn name(&self) -> &str {
            "email.slow"
        }

        async fn dispatch(&self, _ctx: &DispatchContext) -> Result<ProviderAck, ProviderError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ProviderAck {
                provider_message_id: "late".to_string(),
                accepted_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn adapter_deadline_becomes_timeout_error() {
        let registry = breakers(5);
        let p = AdapterPair {
            primary: Arc::new(SlowAdapter),
            fallback: None,
        };
        let err = dispatch_with_breaker(&registry, &p, &ctx(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.retryable);
    }
}
