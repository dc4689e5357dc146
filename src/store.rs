//! Dual-Engine Store
//!
//! Routes every cache operation to the distributed engine while it is healthy
//! and to the in-process engine otherwise.
//!
//! ```text
//! set / get / delete / purge
//!        │
//!        ├── EngineHealth connected ──► distributed engine (Redis)
//!        │                                 │ error → log, demote, degrade
//!        └── disconnected ────────────► in-process engine (LocalCache)
//! ```
//!
//! A single distributed-engine error demotes the whole process. Reads that
//! fail resolve as misses; writes and deletes that fail are swallowed after
//! logging. Nothing here ever returns an error to the caller.
//!
//! Invalidations that the distributed engine misses while it is not in use
//! are kept in a [`RemoteBacklog`] and replayed before it serves reads again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::backends::LocalCache;
use crate::config::RetryPolicy;
use crate::health::{EngineHealth, RemoteBacklog, spawn_recovery};
use crate::traits::{CacheBackend, CacheLookup};

/// Engine currently serving operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Distributed,
    InProcess,
}

/// Store router statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub purges: u64,
    pub remote_errors: u64,
}

#[derive(Debug, Default)]
struct AtomicStoreStats {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    purges: AtomicU64,
    remote_errors: AtomicU64,
}

impl AtomicStoreStats {
    fn snapshot(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
        }
    }
}

/// Router over the distributed and in-process engines
pub struct CacheStore {
    local: Arc<LocalCache>,
    remote: Option<Arc<dyn CacheBackend>>,
    health: EngineHealth,
    backlog: Arc<RemoteBacklog>,
    retry: RetryPolicy,
    auto_reconnect: bool,
    stats: AtomicStoreStats,
}

impl CacheStore {
    /// Create a router; `remote` is only used while `health` is connected.
    #[must_use]
    pub fn new(
        local: Arc<LocalCache>,
        remote: Option<Arc<dyn CacheBackend>>,
        health: EngineHealth,
    ) -> Self {
        Self {
            local,
            remote,
            health,
            backlog: Arc::new(RemoteBacklog::new()),
            retry: RetryPolicy::default(),
            auto_reconnect: false,
            stats: AtomicStoreStats::default(),
        }
    }

    /// A router that only ever uses the in-process engine
    #[must_use]
    pub fn local_only(capacity: usize) -> Self {
        Self::new(Arc::new(LocalCache::new(capacity)), None, EngineHealth::new())
    }

    /// Reconnect behavior after a mid-session demotion
    #[must_use]
    pub fn with_reconnect(mut self, retry: RetryPolicy, enabled: bool) -> Self {
        self.retry = retry;
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn health(&self) -> &EngineHealth {
        &self.health
    }

    /// Invalidations waiting to be replayed on the distributed engine
    #[must_use]
    pub fn backlog(&self) -> &RemoteBacklog {
        &self.backlog
    }

    #[must_use]
    pub fn local(&self) -> &Arc<LocalCache> {
        &self.local
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        if self.active_remote().is_some() {
            Engine::Distributed
        } else {
            Engine::InProcess
        }
    }

    /// `true` while operations are served by the in-process engine
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.engine() == Engine::InProcess
    }

    fn active_remote(&self) -> Option<&Arc<dyn CacheBackend>> {
        if self.health.is_connected() {
            self.remote.as_ref()
        } else {
            None
        }
    }

    /// Read an entry from the active engine
    pub async fn get(&self, key: &str) -> CacheLookup {
        let lookup = match self.active_remote() {
            Some(remote) => match remote.get(key).await {
                Ok(lookup) => lookup,
                Err(e) => {
                    self.demote("get", key, &e);
                    CacheLookup::Miss
                }
            },
            None => self.local.get(key),
        };

        let counter = match &lookup {
            CacheLookup::Hit(_) => &self.stats.hits,
            CacheLookup::Negative => &self.stats.negative_hits,
            CacheLookup::Miss => &self.stats.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        lookup
    }

    /// Store a snapshot, or a negative marker when `value` is `None`
    pub async fn set(&self, key: &str, value: Option<&serde_json::Value>, ttl: Duration) {
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        match self.active_remote() {
            Some(remote) => {
                if let Err(e) = remote.set_with_ttl(key, value, ttl).await {
                    self.backlog.record_key(key);
                    self.demote("set", key, &e);
                }
            }
            None => self.local.set(key, value.cloned(), ttl),
        }
    }

    /// Remove an entry from the active engine
    pub async fn delete(&self, key: &str) {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        match self.active_remote() {
            Some(remote) => {
                if let Err(e) = remote.remove(key).await {
                    self.backlog.record_key(key);
                    self.demote("delete", key, &e);
                }
            }
            None => {
                self.record_missed_key(key);
                self.local.remove(key);
            }
        }
    }

    /// Remove an entry from the distributed engine only, if it is active
    pub async fn delete_remote(&self, key: &str) {
        match self.active_remote() {
            Some(remote) => {
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = remote.remove(key).await {
                    self.backlog.record_key(key);
                    self.demote("delete", key, &e);
                }
            }
            None => self.record_missed_key(key),
        }
    }

    /// Remove every key under `prefix` from the active engine, keeping `except`
    pub async fn purge_namespace(&self, prefix: &str, except: &[String]) -> usize {
        self.stats.purges.fetch_add(1, Ordering::Relaxed);
        let removed = match self.active_remote() {
            Some(remote) => match remote.purge_prefix(prefix, except).await {
                Ok(removed) => removed,
                Err(e) => {
                    self.backlog.record_prefix(prefix);
                    self.demote("purge", prefix, &e);
                    0
                }
            },
            None => {
                if self.remote.is_some() {
                    self.backlog.record_prefix(prefix);
                }
                self.local.purge_prefix(prefix, except)
            }
        };
        debug!(prefix = %prefix, removed, engine = ?self.engine(), "Namespace purged");
        removed
    }

    /// Apply an invalidation to the in-process engine only
    ///
    /// Used for messages from sibling shards, whose local caches are the ones
    /// that can diverge.
    pub fn evict_local(&self, keys: &[String], prefix: Option<&str>) -> usize {
        for key in keys {
            self.record_missed_key(key);
            self.local.remove(key);
        }
        let purged = prefix.map_or(0, |prefix| {
            if self.remote.is_some() && !self.health.is_connected() {
                self.backlog.record_prefix(prefix);
            }
            self.local.purge_prefix(prefix, &[])
        });
        keys.len() + purged
    }

    fn record_missed_key(&self, key: &str) {
        if self.remote.is_some() && !self.health.is_connected() {
            self.backlog.record_key(key);
        }
    }

    /// Ping the distributed engine; `true` when none is configured
    pub async fn health_check(&self) -> bool {
        match &self.remote {
            Some(remote) => remote.health_check().await,
            None => true,
        }
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }

    fn demote(&self, operation: &str, key: &str, e: &anyhow::Error) {
        self.stats.remote_errors.fetch_add(1, Ordering::Relaxed);
        let backend = self.remote.as_ref().map_or("unknown", |r| r.name());

        if self.health.mark_disconnected() {
            error!(
                backend,
                operation,
                key = %key,
                error = %e,
                "Distributed cache engine failed, falling back to in-process cache"
            );
            if self.auto_reconnect {
                if let Some(remote) = &self.remote {
                    spawn_recovery(
                        &self.health,
                        Arc::clone(remote),
                        Arc::clone(&self.local),
                        Arc::clone(&self.backlog),
                        self.retry,
                    );
                }
            }
        } else {
            warn!(backend, operation, key = %key, error = %e, "Distributed cache operation failed");
        }
    }
}
