use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::CacheConfig;
use crate::error::AppResult;

/// Short-TTL key/value store used for idempotency lookups and scheduler
/// locks.
///
/// The cache is an optimization in front of the store's unique index, never
/// the authority: callers tolerate failed writes, and the 100 ms default
/// operation timeout keeps a degraded Redis from stalling the hot path.
#[derive(Clone)]
pub struct DedupCache {
    conn: ConnectionManager,
    op_timeout: Duration,
    pub dedup_ttl: Duration,
}

fn timeout_err() -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::IoError, "cache operation timed out"))
}

impl DedupCache {
    pub async fn connect(config: &CacheConfig) -> AppResult<DedupCache> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(DedupCache {
            conn,
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            dedup_ttl: Duration::from_secs(config.dedup_ttl_s),
        })
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value = tokio::time::timeout(self.op_timeout, conn.get::<_, Option<String>>(key))
            .await
            .map_err(|_| timeout_err())??;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(
            self.op_timeout,
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()),
        )
        .await
        .map_err(|_| timeout_err())??;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn del(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(self.op_timeout, conn.del::<_, ()>(key))
            .await
            .map_err(|_| timeout_err())??;
        Ok(())
    }

    /// SET NX EX: returns true when this caller won the lock. Used by the
    /// scheduler so concurrent sweeps never republish the same row twice.
    pub async fn setnx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = tokio::time::timeout(
            self.op_timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| timeout_err())??;
        Ok(outcome.is_some())
    }

    /// Liveness check for the readiness probe.
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = tokio::time::timeout(
            self.op_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| timeout_err())??;
        Ok(())
    }
}
