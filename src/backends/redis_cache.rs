//! Redis Cache - Distributed Engine
//!
//! Shared cross-process cache. Values are stored as JSON strings with a
//! millisecond expiry; negative markers are stored as a reserved sentinel
//! string so that "known absent" is distinguishable from "not cached".

use anyhow::{Context, Result};
use redis::Client;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::{CacheError, CacheResult};

/// Stored in place of a value to mark a query that returned nothing
pub const NEGATIVE_SENTINEL: &str = "__hybrid_model_cache:negative__";

const DEFAULT_SCAN_BATCH: usize = 100;

/// Redis distributed cache with `ConnectionManager` for automatic reconnection
///
/// This is the distributed engine of the store router, providing:
/// - Caching shared across bot shards and processes
/// - Negative markers via a sentinel value
/// - Incremental `SCAN`-based namespace purges
pub struct RedisCache {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    /// Keys requested per SCAN round trip
    scan_batch: usize,
    /// Hit counter
    hits: Arc<AtomicU64>,
    /// Miss counter
    misses: Arc<AtomicU64>,
    /// Set counter
    sets: Arc<AtomicU64>,
}

impl RedisCache {
    /// Create new Redis cache with custom URL
    ///
    /// Connects through a `ConnectionManager` and verifies the link with `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        let target = redact_url(redis_url);
        info!(redis_url = %target, "Initializing Redis Cache with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {target}"))?;

        // Create ConnectionManager - handles reconnection automatically
        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        // Test connection
        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %target, "Redis Cache connected successfully (ConnectionManager enabled)");

        Ok(Self {
            conn_manager,
            scan_batch: DEFAULT_SCAN_BATCH,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Connect with bounded retries and capped linear backoff
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidConfig` for an unparseable URL and
    /// `CacheError::ConnectFailed` once the retry budget is spent.
    pub async fn connect_with_retry(
        redis_url: &str,
        retry: RetryPolicy,
    ) -> CacheResult<Self> {
        let target = redact_url(redis_url);

        if let Err(e) = Client::open(redis_url) {
            return Err(CacheError::InvalidConfig(format!("{target}: {e}")));
        }

        let attempts = retry.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::with_url(redis_url).await {
                Ok(cache) => return Ok(cache),
                Err(e) => {
                    last_error = format!("{e:#}");
                    if attempt < attempts {
                        let delay = retry.backoff(attempt);
                        warn!(
                            redis_url = %target,
                            attempt,
                            delay_ms = delay.as_millis(),
                            error = %last_error,
                            "Redis connection failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(CacheError::ConnectFailed {
            target,
            attempts,
            reason: last_error,
        })
    }

    /// Set how many keys each `SCAN` round trip asks for
    #[must_use]
    pub fn with_scan_batch(mut self, scan_batch: usize) -> Self {
        self.scan_batch = scan_batch.max(1);
        self
    }

    fn decode(raw: &str) -> CacheResult<CacheLookup> {
        if raw == NEGATIVE_SENTINEL {
            return Ok(CacheLookup::Negative);
        }
        Ok(CacheLookup::Hit(serde_json::from_str(raw)?))
    }

    fn encode(value: Option<&serde_json::Value>) -> CacheResult<String> {
        match value {
            None => Ok(NEGATIVE_SENTINEL.to_string()),
            Some(value) => Ok(serde_json::to_string(value)?),
        }
    }

    /// Counters: (hits, misses, sets)
    #[must_use]
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.sets.load(Ordering::Relaxed),
        )
    }
}

/// Escape glob metacharacters so a literal prefix can be used with `MATCH`
#[must_use]
pub fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Hide credentials before a URL reaches the logs
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

// ===== Trait Implementations =====

use crate::traits::{CacheBackend, CacheLookup};
use async_trait::async_trait;

/// Implement `CacheBackend` trait for `RedisCache`
#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<CacheLookup> {
        let mut conn = self.conn_manager.clone();

        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;

        let Some(raw) = raw else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(CacheLookup::Miss);
        };

        match Self::decode(&raw) {
            Ok(lookup) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(lookup)
            }
            Err(e) => {
                // Corrupt payloads read as misses; the caller refetches.
                warn!(key = %key, error = %e, "[Redis] Failed to decode cached payload");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::Miss)
            }
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Option<&serde_json::Value>,
        ttl: Duration,
    ) -> Result<()> {
        let payload = Self::encode(value)?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn_manager.clone();

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_ms, negative = value.is_none(), "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: usize = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    /// Cursor-based `SCAN` deleting each batch as it arrives, so large
    /// keyspaces are never listed in full.
    async fn purge_prefix(&self, prefix: &str, except: &[String]) -> Result<usize> {
        let mut conn = self.conn_manager.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            // SCAN cursor MATCH pattern COUNT batch
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_batch)
                .query_async(&mut conn)
                .await?;

            let batch: Vec<String> = keys.into_iter().filter(|k| !except.contains(k)).collect();
            if !batch.is_empty() {
                let count: usize = redis::cmd("DEL").arg(&batch).query_async(&mut conn).await?;
                removed += count;
            }

            cursor = next;
            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(prefix = %prefix, removed, "[Redis] Purged namespace");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
