//! Cache Backend Traits
//!
//! The seam between the store router and the concrete engines.
//!
//! # Architecture
//!
//! - `CacheBackend`: one cache engine (distributed or in-process)
//! - `CacheLookup`: the three outcomes of a read
//!
//! The router never inspects record shapes; values travel as
//! `serde_json::Value` snapshots and are rehydrated by the model layer.
//!
//! # Example: Custom Backend
//!
//! ```rust,ignore
//! use hybrid_model_cache::{CacheBackend, CacheLookup, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyRemoteCache {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheBackend for MyRemoteCache {
//!     async fn get(&self, key: &str) -> Result<CacheLookup> { todo!() }
//!     async fn set_with_ttl(&self, key: &str, value: Option<&serde_json::Value>, ttl: Duration) -> Result<()> { todo!() }
//!     async fn remove(&self, key: &str) -> Result<()> { todo!() }
//!     async fn purge_prefix(&self, prefix: &str, except: &[String]) -> Result<usize> { todo!() }
//!     async fn health_check(&self) -> bool { todo!() }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a cache read
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Nothing cached under the key (or it expired)
    Miss,
    /// The query was run before and returned nothing
    Negative,
    /// A cached snapshot
    Hit(serde_json::Value),
}

impl CacheLookup {
    /// `true` for both positive and negative hits
    #[must_use]
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }

    /// The cached value, `None` for negative hits and misses
    #[must_use]
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss | Self::Negative => None,
        }
    }
}

/// One cache engine
///
/// Implementations must be `Send + Sync`; the router shares them across
/// tasks. Errors returned here are treated by the router as engine failures.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read an entry
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    async fn get(&self, key: &str) -> Result<CacheLookup>;

    /// Store a snapshot, or a negative marker when `value` is `None`
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Option<&serde_json::Value>,
        ttl: Duration,
    ) -> Result<()>;

    /// Remove an entry (positive or negative)
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every entry whose key starts with `prefix`, except `except`
    ///
    /// Returns the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be reached.
    async fn purge_prefix(&self, prefix: &str, except: &[String]) -> Result<usize>;

    /// Check if the engine is reachable
    async fn health_check(&self) -> bool;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}
