use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The store-agnostic contract spec.md §4.2 describes: atomic increment
/// pipelined with a TTL read, explicit expiry, prefix scan, and delete.
/// `RedisStore` is the production implementation; `InMemoryStore` backs
/// tests that would otherwise need a live Redis.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically increments `key` and returns `(new_count, ttl_seconds)`.
    /// `ttl_seconds` is `-1` if the key has no expiry yet (i.e. it was just
    /// created by this call).
    async fn increment_and_get_ttl(&self, key: &str) -> Result<(i64, i64)>;
    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()>;
    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, keys: &[String]) -> Result<()>;
    async fn health_check(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("failed to create Redis connection manager")?;
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment_and_get_ttl(&self, key: &str) -> Result<(i64, i64)> {
        let mut conn = self.manager.clone();
        // INCR and TTL pipelined in a single round-trip so the increment stays
        // atomic against the shared store.
        let (count, ttl): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .ttl(key)
            .query_async(&mut conn)
            .await
            .context("rate limit store pipeline failed")?;
        Ok((count, ttl))
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.expire(key, seconds as i64).await.context("failed to set expiry")?;
        Ok(())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut found = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .context("SCAN failed")?;
            found.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(found)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: () = conn.del(keys).await.context("failed to delete keys")?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

/// In-process fake used by tests: no TTL expiry simulation beyond what the
/// caller drives explicitly via `set_expiry`, since tests assert cascade and
/// fail-open behavior rather than real wall-clock expiry.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<HashMap<String, (i64, Option<u64>)>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn increment_and_get_ttl(&self, key: &str) -> Result<(i64, i64)> {
        let mut guard = self.inner.lock().await;
        let entry = guard.entry(key.to_string()).or_insert((0, None));
        entry.0 += 1;
        let ttl = entry.1.map(|s| s as i64).unwrap_or(-1);
        Ok((entry.0, ttl))
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get_mut(key) {
            entry.1 = Some(seconds);
        }
        Ok(())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>> {
        let guard = self.inner.lock().await;
        Ok(guard.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A store wrapper that always fails, used to exercise the limiter's
/// fail-open path without standing up a broken Redis.
#[derive(Clone, Default)]
pub struct AlwaysFailingStore;

#[async_trait]
impl RateLimitStore for AlwaysFailingStore {
    async fn increment_and_get_ttl(&self, _key: &str) -> Result<(i64, i64)> {
        anyhow::bail!("simulated store transport failure")
    }
    async fn set_expiry(&self, _key: &str, _seconds: u64) -> Result<()> {
        anyhow::bail!("simulated store transport failure")
    }
    async fn keys_matching(&self, _prefix: &str) -> Result<Vec<String>> {
        anyhow::bail!("simulated store transport failure")
    }
    async fn delete(&self, _keys: &[String]) -> Result<()> {
        anyhow::bail!("simulated store transport failure")
    }
    async fn health_check(&self) -> Result<()> {
        anyhow::bail!("simulated store transport failure")
    }
}
