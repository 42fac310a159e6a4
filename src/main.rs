use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod config;
mod db;
mod error;
mod kafka;
mod metrics;
mod providers;
mod routes;
mod services;

use cache::DedupCache;
use config::Config;
use services::ingestion::IngestionService;

/// Shared state behind the HTTP surfaces. The pipeline side (workers,
/// scheduler, retry router) gets its dependencies passed explicitly at
/// startup instead.
pub struct AppState {
    pub db: sqlx::PgPool,
    pub cache: DedupCache,
    pub ingestion: IngestionService,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(db: sqlx::PgPool, cache: DedupCache, ingestion: IngestionService) -> AppState {
        AppState {
            db,
            cache,
            ingestion,
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_dispatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting notification dispatch engine");

    // The supervisor owns startup ordering, readiness, and the drain.
    // Exit codes: 0 clean drain, 1 fatal dependency failure, 2 drain
    // window exceeded.
    match services::supervisor::run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("Fatal startup failure: {:?}", e);
            std::process::exit(1);
        }
    }
}
