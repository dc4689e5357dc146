//! Registry of cached models
//!
//! Every [`ModelCache`] created by a [`CacheSystem`](crate::CacheSystem) is
//! registered here as a type-erased [`ModelHooks`] handle so that
//! process-wide operations (purging everything, listing models) can reach
//! all of them without knowing their types.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{CachedModel, ModelStore};
use crate::model_cache::ModelCache;

/// Type-erased view of one model's cache
#[async_trait]
pub trait ModelHooks: Send + Sync {
    fn model_name(&self) -> &'static str;

    /// Key prefix of this model
    fn namespace(&self) -> String;

    /// Drop every cached entry of this model; returns how many were removed
    async fn purge(&self) -> usize;
}

#[async_trait]
impl<M, S> ModelHooks for ModelCache<M, S>
where
    M: CachedModel,
    S: ModelStore<M> + 'static,
{
    fn model_name(&self) -> &'static str {
        M::NAME
    }

    fn namespace(&self) -> String {
        ModelCache::namespace(self)
    }

    async fn purge(&self) -> usize {
        self.invalidate_namespace().await
    }
}

/// Registered models keyed by name
#[derive(Default)]
pub struct ModelRegistry {
    models: DashMap<&'static str, Arc<dyn ModelHooks>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model; a later registration under the same name replaces
    /// the earlier one
    pub fn register(&self, hooks: Arc<dyn ModelHooks>) {
        let name = hooks.model_name();
        if self.models.insert(name, hooks).is_some() {
            debug!(model = name, "Replaced cached model registration");
        } else {
            debug!(model = name, "Registered cached model");
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelHooks>> {
        self.models.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered model names, sorted
    #[must_use]
    pub fn model_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.models.iter().map(|entry| *entry.key()).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Purge the namespace of every registered model
    pub async fn purge_all(&self) -> usize {
        // Collect first: no map guard may be held across an await.
        let models: Vec<Arc<dyn ModelHooks>> = self
            .models
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut purged = 0;
        for model in &models {
            purged += model.purge().await;
        }
        info!(models = models.len(), purged, "Purged all cached models");
        purged
    }
}
