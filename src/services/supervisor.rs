use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::cache::DedupCache;
use crate::config::Config;
use crate::kafka::LogProducer;
use crate::providers::AdapterRegistry;
use crate::services::breaker::BreakerRegistry;
use crate::services::ingestion::IngestionService;
use crate::services::retry::RetryRouter;
use crate::services::scheduler::Scheduler;
use crate::services::worker::DeliveryWorker;
use crate::services::init;
use crate::AppState;

/// Exit code for a clean shutdown after a full drain.
pub const EXIT_CLEAN: i32 = 0;
/// Exit code when the drain window elapsed with work still in flight.
pub const EXIT_DRAIN_EXCEEDED: i32 = 2;

/// Run the whole engine: open dependencies in order, start the surfaces,
/// declare readiness, then wait for a termination signal and drain.
///
/// Startup order matters: store, cache and producer first; the HTTP server
/// (status ingress included) before the scheduler and the workers, so
/// provider callbacks are never missed during warm-up.
pub async fn run(config: Config) -> anyhow::Result<i32> {
    let pool = init::init_db(&config).await?;
    let cache = DedupCache::connect(&config.cache)
        .await
        .map_err(|e| anyhow::anyhow!("cache connect failed: {e}"))?;
    let producer = LogProducer::new(&config.kafka)?;

    let ingestion = IngestionService::new(
        pool.clone(),
        cache.clone(),
        producer.clone(),
        config.clone(),
    );
    let state = Arc::new(AppState::new(pool.clone(), cache.clone(), ingestion));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HTTP server: submission ingress, status ingress, health probes.
    let app = crate::routes::router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    let http_shutdown = shutdown_rx.clone();
    let http_handle = tokio::spawn(async move {
        let mut http_shutdown = http_shutdown;
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    // Scheduler before workers: due SCHEDULED rows should start flowing as
    // soon as consumers exist, and the recovery sweep is harmless earlier.
    let scheduler = Scheduler::new(
        pool.clone(),
        cache.clone(),
        producer.clone(),
        config.scheduler.clone(),
    );
    let mut scheduler_handle = scheduler.spawn(shutdown_rx.clone());

    // Delivery workers.
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let adapters = AdapterRegistry::from_config(&config);
    let retry_router = Arc::new(RetryRouter::new(
        pool.clone(),
        producer.clone(),
        config.retry.clone(),
    ));
    let worker = Arc::new(DeliveryWorker::new(
        pool.clone(),
        producer.clone(),
        adapters,
        breakers,
        retry_router,
        Arc::new(config.clone()),
    ));
    let inflight = worker.inflight_counter();
    let worker_handles = worker.spawn_consumers(shutdown_rx.clone());

    state.set_ready(true);
    tracing::info!("Notification dispatch engine ready");

    wait_for_termination().await;
    tracing::info!("Termination signal received, starting graceful shutdown");

    // 1. Stop accepting new ingestion; the gateway drains on NOT_READY.
    state.set_ready(false);
    // 2. Signal workers and scheduler to stop fetching.
    let _ = shutdown_tx.send(true);

    // 3. Wait for the in-flight dispatch pool to empty, bounded.
    let drain_budget = Duration::from_millis(config.supervisor.drain_timeout_ms);
    let deadline = Instant::now() + drain_budget;
    while inflight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let leftover = inflight.load(Ordering::SeqCst);

    // 4. Join the workers so final offsets are committed; abort stragglers.
    // Aborted tasks leave their message uncommitted, which redelivers it to
    // another worker where the idempotency re-check decides.
    let mut aborted = false;
    for mut handle in worker_handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining.max(Duration::from_millis(100)), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
            aborted = true;
        }
    }
    if tokio::time::timeout(Duration::from_secs(1), &mut scheduler_handle)
        .await
        .is_err()
    {
        scheduler_handle.abort();
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), http_handle).await;

    // 5. Flush the producer, then drop the pools.
    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        tracing::warn!("Producer flush during shutdown failed: {}", e);
    }
    pool.close().await;

    if leftover > 0 || aborted {
        tracing::warn!(
            leftover,
            "Drain window exceeded, some dispatches were left uncommitted"
        );
        Ok(EXIT_DRAIN_EXCEEDED)
    } else {
        tracing::info!("Clean shutdown");
        Ok(EXIT_CLEAN)
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
