//! Cache configuration.
//!
//! Everything the cache layer needs is passed in explicitly through
//! [`CacheConfig`] and threaded to the components that use it.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CACHE_VERSION: &str = "v1";
const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_COUNT_TTL_SECS: u64 = 300;
const DEFAULT_MAX_LOCAL_ENTRIES: usize = 1000;
const DEFAULT_SCAN_BATCH: usize = 100;

/// Top-level cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version tag prefixed to every key. Bump it to orphan every cached shape.
    pub cache_version: String,
    /// Distributed engine target. `None` (or a blank URL) means in-process only.
    pub redis: Option<RedisConnection>,
    /// Default entry TTL for point and list lookups
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    /// TTL for aggregate (`count`) entries
    #[serde(with = "duration_secs")]
    pub count_ttl: Duration,
    /// Capacity of the in-process engine
    pub max_local_entries: usize,
    /// Keys requested per `SCAN` round trip during namespace purges
    pub scan_batch: usize,
    /// Connect / reconnect behavior of the distributed engine
    pub retry: RetryPolicy,
    /// Try to restore the distributed engine after a mid-session failure
    pub auto_reconnect: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            redis: None,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            count_ttl: Duration::from_secs(DEFAULT_COUNT_TTL_SECS),
            max_local_entries: DEFAULT_MAX_LOCAL_ENTRIES,
            scan_batch: DEFAULT_SCAN_BATCH,
            retry: RetryPolicy::default(),
            auto_reconnect: true,
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by environment variables
    ///
    /// Reads `REDIS_URL`, `CACHE_VERSION`, `CACHE_DEFAULT_TTL_SECS`,
    /// `CACHE_COUNT_TTL_SECS` and `CACHE_MAX_LOCAL_ENTRIES`. Unparseable
    /// numbers keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis = Some(RedisConnection::Url(url));
        }
        if let Ok(version) = std::env::var("CACHE_VERSION") {
            if !version.trim().is_empty() {
                config.cache_version = version;
            }
        }
        if let Some(secs) = env_parse::<u64>("CACHE_DEFAULT_TTL_SECS") {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CACHE_COUNT_TTL_SECS") {
            config.count_ttl = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<usize>("CACHE_MAX_LOCAL_ENTRIES") {
            config.max_local_entries = max;
        }

        config
    }

    #[must_use]
    pub fn with_redis(mut self, redis: impl Into<RedisConnection>) -> Self {
        self.redis = Some(redis.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    #[must_use]
    pub fn with_max_local_entries(mut self, max: usize) -> Self {
        self.max_local_entries = max;
        self
    }

    /// Returns the Redis URL to connect to, or `None` for in-process only mode.
    #[must_use]
    pub fn redis_url(&self) -> Option<String> {
        match self.redis.as_ref()? {
            RedisConnection::Url(url) if url.trim().is_empty() => None,
            RedisConnection::Url(url) => Some(url.trim().to_string()),
            RedisConnection::Options(options) => options.to_url(),
        }
    }

    /// In-process capacity, clamped to at least one entry
    #[must_use]
    pub fn local_capacity(&self) -> usize {
        self.max_local_entries.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Either a connection string or structured options
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RedisConnection {
    Url(String),
    Options(RedisOptions),
}

impl From<&str> for RedisConnection {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for RedisConnection {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<RedisOptions> for RedisConnection {
    fn from(options: RedisOptions) -> Self {
        Self::Options(options)
    }
}

/// Structured Redis connection options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: Option<i64>,
    pub tls: bool,
}

impl RedisOptions {
    /// Render as a `redis://` (or `rediss://`) URL; blank host means no engine.
    #[must_use]
    pub fn to_url(&self) -> Option<String> {
        let host = self.host.trim();
        if host.is_empty() {
            return None;
        }

        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        let port = self.port.unwrap_or(6379);
        let db = self.db.map(|db| format!("/{db}")).unwrap_or_default();

        Some(format!("{scheme}://{auth}{host}:{port}{db}"))
    }
}

/// Bounded retries with capped linear backoff
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first failure before giving up
    pub max_retries: u32,
    /// Backoff growth per attempt
    #[serde(with = "duration_millis")]
    pub step: Duration,
    /// Upper bound on a single backoff
    #[serde(with = "duration_millis")]
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            step: Duration::from_millis(500),
            cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }
}

/// Per-model cache settings
#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    /// Overrides [`CacheConfig::default_ttl`] for this model
    pub ttl: Option<Duration>,
    /// Extra field sets that uniquely identify a record, warmed on save
    pub alternate_keys: Vec<Vec<&'static str>>,
}

impl ModelSettings {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_alternate_key(mut self, fields: &[&'static str]) -> Self {
        self.alternate_keys.push(fields.to_vec());
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
