use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub kafka: KafkaConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub scheduler: SchedulerConfig,
    pub supervisor: SupervisorConfig,
    pub dispatch: DispatchConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// Max connections per process. Should be at least twice the worker
    /// dispatch pool so status reconciliation never starves on the pool.
    pub pool_size: u32,
    /// Per-statement timeout in milliseconds.
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    /// Producer send timeout in milliseconds.
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    /// Idempotency entry TTL in seconds. Must cover the longest credible
    /// retry horizon.
    pub dedup_ttl_s: u64,
    /// Per-operation timeout in milliseconds.
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Consumer tasks per process. Each owns one consumer in the group;
    /// partition assignment distributes work across them.
    pub consumers: u32,
    /// Max in-flight dispatches per process.
    pub dispatch_pool: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a message is moved to the DLQ.
    pub max_attempts: u32,
    /// Initial backoff in milliseconds; doubles per attempt.
    pub base_delay_ms: u64,
    /// Cap for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a probe, in milliseconds.
    pub cooldown_ms: u64,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    /// Max rows advanced or recovered per tick.
    pub batch_size: i64,
    /// PENDING rows older than this are considered stuck and republished.
    pub stuck_after_s: i64,
    /// TTL of the per-row republish lock in the cache.
    pub lock_ttl_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Graceful shutdown budget for draining in-flight dispatches.
    pub drain_timeout_ms: u64,
}

/// Per-channel dispatch timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub email_timeout_ms: u64,
    pub sms_timeout_ms: u64,
    pub push_timeout_ms: u64,
    pub webhook_timeout_ms: u64,
}

/// Endpoints of the channel provider gateways. A channel with no configured
/// endpoint has no adapter; dispatch to it fails permanently.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub email_endpoint: Option<String>,
    pub email_fallback_endpoint: Option<String>,
    pub sms_endpoint: Option<String>,
    pub push_endpoint: Option<String>,
    pub api_token: Option<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("PORT", 8080),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| ConfigError::MissingEnv("DATABASE_URL".to_string()))?,
                pool_size: env_parse("DATABASE_POOL_SIZE", 20),
                statement_timeout_ms: env_parse("DATABASE_STATEMENT_TIMEOUT_MS", 5_000),
            },
            kafka: KafkaConfig {
                brokers: env::var("KAFKA_BROKERS")
                    .map_err(|_| ConfigError::MissingEnv("KAFKA_BROKERS".to_string()))?,
                consumer_group: env::var("KAFKA_CONSUMER_GROUP")
                    .unwrap_or_else(|_| "notification-workers".to_string()),
                publish_timeout_ms: env_parse("KAFKA_PUBLISH_TIMEOUT_MS", 3_000),
            },
            cache: CacheConfig {
                url: env::var("REDIS_URL")
                    .map_err(|_| ConfigError::MissingEnv("REDIS_URL".to_string()))?,
                dedup_ttl_s: env_parse("DEDUP_TTL_SECONDS", 86_400),
                op_timeout_ms: env_parse("CACHE_OP_TIMEOUT_MS", 100),
            },
            worker: WorkerConfig {
                consumers: env_parse("WORKER_CONSUMERS", 4),
                dispatch_pool: env_parse("WORKER_DISPATCH_POOL", 64),
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 5),
                base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", 1_000),
                max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", 60_000),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
                cooldown_ms: env_parse("BREAKER_COOLDOWN_MS", 30_000),
                success_threshold: env_parse("BREAKER_SUCCESS_THRESHOLD", 2),
            },
            scheduler: SchedulerConfig {
                tick_ms: env_parse("SCHEDULER_TICK_MS", 5_000),
                batch_size: env_parse("SCHEDULER_BATCH_SIZE", 500),
                stuck_after_s: env_parse("SCHEDULER_STUCK_AFTER_SECONDS", 60),
                lock_ttl_s: env_parse("SCHEDULER_LOCK_TTL_SECONDS", 30),
            },
            supervisor: SupervisorConfig {
                drain_timeout_ms: env_parse("DRAIN_TIMEOUT_MS", 30_000),
            },
            dispatch: DispatchConfig {
                email_timeout_ms: env_parse("DISPATCH_TIMEOUT_EMAIL_MS", 10_000),
                sms_timeout_ms: env_parse("DISPATCH_TIMEOUT_SMS_MS", 5_000),
                push_timeout_ms: env_parse("DISPATCH_TIMEOUT_PUSH_MS", 5_000),
                webhook_timeout_ms: env_parse("DISPATCH_TIMEOUT_WEBHOOK_MS", 10_000),
            },
            providers: ProvidersConfig {
                email_endpoint: env::var("PROVIDER_EMAIL_ENDPOINT").ok(),
                email_fallback_endpoint: env::var("PROVIDER_EMAIL_FALLBACK_ENDPOINT").ok(),
                sms_endpoint: env::var("PROVIDER_SMS_ENDPOINT").ok(),
                push_endpoint: env::var("PROVIDER_PUSH_ENDPOINT").ok(),
                api_token: env::var("PROVIDER_API_TOKEN").ok(),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/notifications".to_string(),
                pool_size: 20,
                statement_timeout_ms: 5_000,
            },
            kafka: KafkaConfig {
                brokers: "localhost:9092".to_string(),
                consumer_group: "notification-workers".to_string(),
                publish_timeout_ms: 3_000,
            },
            cache: CacheConfig {
                url: "redis://localhost:6379".to_string(),
                dedup_ttl_s: 86_400,
                op_timeout_ms: 100,
            },
            worker: WorkerConfig {
                consumers: 4,
                dispatch_pool: 64,
            },
            retry: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown_ms: 30_000,
                success_threshold: 2,
            },
            scheduler: SchedulerConfig {
                tick_ms: 5_000,
                batch_size: 500,
                stuck_after_s: 60,
                lock_ttl_s: 30,
            },
            supervisor: SupervisorConfig {
                drain_timeout_ms: 30_000,
            },
            dispatch: DispatchConfig {
                email_timeout_ms: 10_000,
                sms_timeout_ms: 5_000,
                push_timeout_ms: 5_000,
                webhook_timeout_ms: 10_000,
            },
            providers: ProvidersConfig {
                email_endpoint: None,
                email_fallback_endpoint: None,
                sms_endpoint: None,
                push_endpoint: None,
                api_token: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.worker.dispatch_pool, 64);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.cooldown_ms, 30_000);
        assert_eq!(cfg.scheduler.tick_ms, 5_000);
        assert_eq!(cfg.supervisor.drain_timeout_ms, 30_000);
        assert_eq!(cfg.cache.dedup_ttl_s, 86_400);
        assert_eq!(cfg.kafka.consumer_group, "notification-workers");
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("TEST_ENV_PARSE_GARBAGE", "not-a-number");
        let v: u32 = env_parse("TEST_ENV_PARSE_GARBAGE", 7);
        assert_eq!(v, 7);
        std::env::remove_var("TEST_ENV_PARSE_GARBAGE");
    }
}
