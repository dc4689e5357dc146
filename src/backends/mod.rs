//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! ## In-Process
//! - **`LocalCache`** - Bounded insertion-ordered map with negative markers (always available)
//!
//! ## Distributed
//! - **Redis** - Shared cross-process cache (feature: `redis`, on by default)
//!
//! # Usage
//!
//! ```rust,no_run
//! use hybrid_model_cache::backends::{LocalCache, RedisCache};
//! use hybrid_model_cache::RetryPolicy;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let local = LocalCache::new(1000);
//! let redis = RedisCache::connect_with_retry("redis://127.0.0.1:6379", RetryPolicy::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod local_cache;

#[cfg(feature = "redis")]
pub mod redis_cache;

pub use local_cache::{LocalCache, LocalCacheStats};

#[cfg(feature = "redis")]
pub use redis_cache::{NEGATIVE_SENTINEL, RedisCache};
