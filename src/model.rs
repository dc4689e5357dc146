//! Model abstractions
//!
//! - `CachedModel`: a record type the cache can snapshot and rehydrate
//! - `ModelStore`: the ORM collaborator that actually runs queries
//!
//! The cache layer never looks inside a record beyond its snapshot; the
//! rehydration hook is the only place that knows how nested associations are
//! rebuilt.
//!
//! # Example
//!
//! ```rust
//! use hybrid_model_cache::{CachedModel, ModelSettings};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct UserLevel {
//!     id: i64,
//!     guild_id: String,
//!     user_id: String,
//!     xp: i64,
//! }
//!
//! impl CachedModel for UserLevel {
//!     const NAME: &'static str = "UserLevel";
//!
//!     fn settings() -> ModelSettings {
//!         ModelSettings::default().with_alternate_key(&["guild_id", "user_id"])
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ModelSettings;
use crate::query::Query;

/// A record type stored by the cache layer
pub trait CachedModel: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Model name, second segment of every cache key
    const NAME: &'static str;

    /// Primary key column
    #[must_use]
    fn primary_key() -> &'static str {
        "id"
    }

    /// TTL override and alternate lookup keys
    #[must_use]
    fn settings() -> ModelSettings {
        ModelSettings::default()
    }

    /// Plain-data projection of this instance
    ///
    /// # Errors
    ///
    /// Returns an error if the instance cannot be represented as JSON.
    fn to_snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rehydration hook: rebuild a live instance from a snapshot
    ///
    /// Override to reattach nested collections that need more than plain
    /// deserialization.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot does not describe a valid instance.
    fn rehydrate(snapshot: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(snapshot)?)
    }
}

/// The ORM collaborator behind a cached model
///
/// Errors from these methods are database errors and are returned to the
/// caller of the cache unchanged.
#[async_trait]
pub trait ModelStore<M: CachedModel>: Send + Sync {
    async fn find_one(&self, query: &Query) -> Result<Option<M>>;

    async fn find_all(&self, query: &Query) -> Result<Vec<M>>;

    /// Atomic find-or-create; `defaults` fills columns absent from the filter.
    /// Returns the instance and whether it was created.
    async fn find_or_create(&self, query: &Query, defaults: &serde_json::Value) -> Result<(M, bool)>;

    async fn count(&self, query: &Query) -> Result<u64>;

    /// Insert or update; returns the persisted instance
    async fn save(&self, instance: &M) -> Result<M>;

    async fn destroy(&self, instance: &M) -> Result<()>;

    async fn bulk_create(&self, instances: Vec<M>) -> Result<Vec<M>>;

    /// Apply `patch` to every matching row; returns the number of rows changed
    async fn bulk_update(&self, query: &Query, patch: &serde_json::Value) -> Result<u64>;

    /// Returns the number of rows removed
    async fn bulk_destroy(&self, query: &Query) -> Result<u64>;
}
