//! Hybrid Model Cache
//!
//! A read-through / write-through cache layer for ORM models featuring:
//! - **Dual engine**: Redis while it is reachable, a bounded in-process map
//!   when it is not, switched automatically and restored in the background
//! - **Negative caching**: "no such record" is cached like any other result
//! - **Request coalescing**: concurrent identical misses share one query
//! - **Write hooks**: saves re-warm point keys and purge stale list/count
//!   entries of the model namespace
//! - **Cross-shard sync**: invalidations are broadcast to sibling shards
//!   while every shard is caching in-process
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hybrid_model_cache::{CacheConfig, CacheSystem, Filter, Query};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystem::new(CacheConfig::from_env()).await?;
//!
//!     // `UserLevel: CachedModel`, `db: ModelStore<UserLevel>`
//!     let levels = cache.model::<UserLevel, _>(Arc::new(db));
//!
//!     let query = Query::new(Filter::new().eq("guild_id", "g1").eq("user_id", "u1"));
//!     if let Some(level) = levels.get_one(&query).await? {
//!         tracing::info!(xp = level.xp, "Found level");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ModelCache ──► key::normalize ──► CacheStore ──► Redis       (healthy)
//!     │                                 └────────► LocalCache  (degraded)
//!     ├── miss ──► PendingQueries ──► ModelStore (database)
//!     └── write hooks ──► purge namespace ──► InvalidationPublisher
//! ```

use anyhow::Result;
use futures_util::Stream;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod backends;
pub mod builder;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod health;
mod hooks;
pub mod key;
pub mod logging;
pub mod model;
pub mod model_cache;
pub mod query;
pub mod registry;
pub mod store;
pub mod sync;
pub mod traits;

pub use backends::{LocalCache, LocalCacheStats};
#[cfg(feature = "redis")]
pub use backends::RedisCache;
pub use builder::CacheSystemBuilder;
pub use config::{CacheConfig, ModelSettings, RedisConnection, RedisOptions, RetryPolicy};
pub use error::{CacheError, CacheResult};
pub use health::EngineHealth;
pub use key::{CacheKey, KeyBody, QueryKind, namespace_prefix, normalize};
pub use model::{CachedModel, ModelStore};
pub use model_cache::{ModelCache, ReadOptions};
pub use query::{Direction, Filter, FilterKey, FilterValue, Op, Query};
pub use registry::{ModelHooks, ModelRegistry};
pub use store::{CacheStore, Engine, StoreStats};
pub use sync::{
    InvalidationEnvelope, InvalidationMessage, InvalidationPublisher, InvalidationStats,
    InvalidationSubscriber, LocalShardBus, ShardTransport,
};
pub use traits::{CacheBackend, CacheLookup};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;

/// Main entry point: one per shard process
///
/// Cloning is cheap; clones share the store, registry and shard identity.
#[derive(Clone)]
pub struct CacheSystem {
    pub(crate) store: Arc<CacheStore>,
    pub(crate) config: Arc<CacheConfig>,
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) publisher: Option<Arc<InvalidationPublisher>>,
    pub(crate) subscriber: Arc<InvalidationSubscriber>,
    pub(crate) instance_id: Uuid,
}

impl CacheSystem {
    /// Build a cache system from `config` with default backends
    ///
    /// # Errors
    ///
    /// See [`CacheSystemBuilder::build`].
    pub async fn new(config: CacheConfig) -> Result<Self> {
        CacheSystemBuilder::new(config).build().await
    }

    /// Build from [`CacheConfig::from_env`]
    ///
    /// # Errors
    ///
    /// See [`CacheSystemBuilder::build`].
    pub async fn from_env() -> Result<Self> {
        Self::new(CacheConfig::from_env()).await
    }

    #[must_use]
    pub fn builder(config: CacheConfig) -> CacheSystemBuilder {
        CacheSystemBuilder::new(config)
    }

    /// Cache facade for model `M` backed by `db`
    ///
    /// The model is registered for [`Self::purge_all`]; calling this again
    /// for the same model replaces the registration.
    pub fn model<M, S>(&self, db: Arc<S>) -> Arc<ModelCache<M, S>>
    where
        M: CachedModel,
        S: ModelStore<M> + 'static,
    {
        let cache = Arc::new(ModelCache::new(
            Arc::clone(&self.store),
            db,
            Arc::clone(&self.config),
            self.publisher.clone(),
        ));
        self.registry.register(Arc::clone(&cache) as Arc<dyn ModelHooks>);
        cache
    }

    /// Store router, for manual cache access
    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Identity of this shard in invalidation envelopes
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn model_names(&self) -> Vec<&'static str> {
        self.registry.model_names()
    }

    /// Purge the namespace of every registered model
    pub async fn purge_all(&self) -> usize {
        self.registry.purge_all().await
    }

    #[must_use]
    pub fn publisher(&self) -> Option<&Arc<InvalidationPublisher>> {
        self.publisher.as_ref()
    }

    /// Apply invalidations broadcast by sibling shards
    ///
    /// `payloads` yields serialized [`InvalidationEnvelope`]s, typically from
    /// the same transport passed to
    /// [`CacheSystemBuilder::with_shard_transport`].
    pub fn start_sync<P>(&self, payloads: P) -> tokio::task::JoinHandle<()>
    where
        P: Stream<Item = String> + Send + 'static,
    {
        self.subscriber.start(payloads)
    }

    /// Statistics of invalidations received from sibling shards
    #[must_use]
    pub fn sync_stats(&self) -> InvalidationStats {
        self.subscriber.stats()
    }

    /// Stop the sibling invalidation subscriber
    pub fn shutdown(&self) {
        self.subscriber.shutdown();
    }

    /// Check the distributed engine
    ///
    /// Returns `true` when it answers or none is configured. A failure is
    /// tolerated: the in-process engine keeps serving.
    pub async fn health_check(&self) -> bool {
        let remote_ok = self.store.health_check().await;
        if remote_ok {
            info!(engine = ?self.store.engine(), "Hybrid cache health check passed");
        } else {
            warn!(engine = ?self.store.engine(), "Distributed cache engine unreachable");
        }
        remote_ok
    }
}
