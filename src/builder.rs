//! Cache System Builder
//!
//! Assembles a [`CacheSystem`] from a [`CacheConfig`] plus optional
//! overrides for the distributed engine, the health flag and the shard
//! transport.
//!
//! # Example: Defaults from the environment
//!
//! ```rust,no_run
//! use hybrid_model_cache::{CacheConfig, CacheSystemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystemBuilder::new(CacheConfig::from_env())
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom distributed backend
//!
//! ```rust,ignore
//! use hybrid_model_cache::{CacheConfig, CacheSystemBuilder};
//! use std::sync::Arc;
//!
//! let remote = Arc::new(MyRemoteCache::new());
//!
//! let cache = CacheSystemBuilder::new(CacheConfig::default())
//!     .with_remote(remote)
//!     .build()
//!     .await?;
//! ```

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends::LocalCache;
use crate::config::CacheConfig;
use crate::health::EngineHealth;
use crate::registry::ModelRegistry;
use crate::store::CacheStore;
use crate::sync::{InvalidationPublisher, InvalidationSubscriber, ShardTransport};
use crate::traits::CacheBackend;
use crate::CacheSystem;

/// Builder for constructing a [`CacheSystem`]
///
/// # Default Behavior
///
/// - **Distributed engine**: Redis at [`CacheConfig::redis_url`], connected
///   with [`CacheConfig::retry`]. No URL, or a failed connect, means the
///   in-process engine serves everything.
/// - **Health flag**: a fresh [`EngineHealth`]
/// - **Shard transport**: none, so nothing is broadcast to sibling shards
pub struct CacheSystemBuilder {
    config: CacheConfig,
    remote: Option<Arc<dyn CacheBackend>>,
    health: Option<EngineHealth>,
    transport: Option<Arc<dyn ShardTransport>>,
    instance_id: Option<Uuid>,
}

impl CacheSystemBuilder {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            remote: None,
            health: None,
            transport: None,
            instance_id: None,
        }
    }

    /// Use a custom distributed backend instead of connecting to Redis
    ///
    /// The backend is pinged once during `build`; it starts active only if
    /// the ping succeeds.
    #[must_use]
    pub fn with_remote(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    /// Share a health flag with other systems or with a test
    #[must_use]
    pub fn with_health(mut self, health: EngineHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Broadcast invalidations to sibling shards over `transport`
    #[must_use]
    pub fn with_shard_transport(mut self, transport: Arc<dyn ShardTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Fixed shard identity; a random one is generated otherwise
    #[must_use]
    pub fn with_instance_id(mut self, id: Uuid) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Build the `CacheSystem`
    ///
    /// Never fails because the distributed engine is unreachable; that only
    /// selects the in-process engine.
    ///
    /// # Errors
    ///
    /// Reserved for configuration problems that prevent any cache from
    /// being built.
    pub async fn build(self) -> Result<CacheSystem> {
        let config = Arc::new(self.config);
        let health = self.health.unwrap_or_default();
        let local = Arc::new(LocalCache::new(config.local_capacity()));

        let remote = match self.remote {
            Some(backend) => {
                if backend.health_check().await {
                    health.mark_connected();
                    info!(backend = backend.name(), "Using custom distributed cache backend");
                } else {
                    warn!(
                        backend = backend.name(),
                        "Custom distributed cache backend unreachable, using in-process cache"
                    );
                }
                Some(backend)
            }
            None => connect_default(&config, &health).await,
        };

        let store = Arc::new(
            CacheStore::new(local, remote, health).with_reconnect(config.retry, config.auto_reconnect),
        );

        let instance_id = self.instance_id.unwrap_or_else(Uuid::new_v4);
        let publisher = self
            .transport
            .map(|transport| Arc::new(InvalidationPublisher::new(instance_id, transport)));
        let subscriber = Arc::new(InvalidationSubscriber::new(instance_id, Arc::clone(&store)));

        info!(
            %instance_id,
            engine = ?store.engine(),
            cache_version = %config.cache_version,
            shard_sync = publisher.is_some(),
            "Hybrid model cache ready"
        );

        Ok(CacheSystem {
            store,
            config,
            registry: Arc::new(ModelRegistry::new()),
            publisher,
            subscriber,
            instance_id,
        })
    }
}

#[cfg(feature = "redis")]
async fn connect_default(config: &CacheConfig, health: &EngineHealth) -> Option<Arc<dyn CacheBackend>> {
    use crate::backends::RedisCache;

    let Some(url) = config.redis_url() else {
        info!("No distributed cache configured, using in-process cache only");
        return None;
    };

    match RedisCache::connect_with_retry(&url, config.retry).await {
        Ok(redis) => {
            health.mark_connected();
            Some(Arc::new(redis.with_scan_batch(config.scan_batch)))
        }
        Err(e) => {
            warn!(error = %e, "Distributed cache unavailable, using in-process cache only");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_default(config: &CacheConfig, _health: &EngineHealth) -> Option<Arc<dyn CacheBackend>> {
    if config.redis_url().is_some() {
        warn!("Redis configured but the `redis` feature is disabled, using in-process cache only");
    }
    None
}
