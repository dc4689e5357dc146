//! Write-Through / Invalidation Hooks
//!
//! Keep the cache consistent with writes made through [`ModelCache`]:
//!
//! - `after_save`: re-warm the instance's point keys, purge everything else
//!   in the model namespace (list and count entries may now be wrong)
//! - `after_destroy`: replace the point keys with negative markers, purge the
//!   rest of the namespace
//! - bulk hooks: purge the whole namespace
//!
//! While the store runs on the in-process engine each hook also broadcasts
//! its invalidation to sibling shards.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::key::{CacheKey, QueryKind};
use crate::model::{CachedModel, ModelStore};
use crate::model_cache::ModelCache;
use crate::query::{Filter, Query};
use crate::sync::InvalidationMessage;

impl<M: CachedModel, S: ModelStore<M>> ModelCache<M, S> {
    /// Point-lookup keys identifying `snapshot`: the primary key plus each
    /// declared alternate key whose fields are all present and non-null
    #[must_use]
    pub fn candidate_keys(&self, snapshot: &Value) -> Vec<CacheKey> {
        let primary = [M::primary_key()];
        let field_sets = std::iter::once(primary.as_slice())
            .chain(self.settings.alternate_keys.iter().map(Vec::as_slice));

        let mut keys: Vec<CacheKey> = Vec::new();
        'sets: for fields in field_sets {
            let mut filter = Filter::new();
            for field in fields {
                match snapshot.get(field) {
                    Some(value) if !value.is_null() => filter = filter.eq(*field, value),
                    _ => continue 'sets,
                }
            }
            if filter.is_empty() {
                continue;
            }
            let key = self.key_for(&Query::new(filter), QueryKind::One);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Refresh the cache after `instance` was inserted or updated
    pub async fn after_save(&self, instance: &M) {
        let snapshot = match instance.to_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(model = M::NAME, error = %e, "Failed to snapshot saved record, purging namespace");
                self.invalidate_namespace().await;
                return;
            }
        };

        let keys = self.candidate_keys(&snapshot);
        let ttl = self.ttl();
        for key in &keys {
            self.store.set(key.as_str(), Some(&snapshot), ttl).await;
        }

        let warmed: Vec<String> = keys.into_iter().map(CacheKey::into_string).collect();
        let prefix = self.namespace();
        let purged = self.store.purge_namespace(&prefix, &warmed).await;
        debug!(model = M::NAME, warmed = warmed.len(), purged, "Cache refreshed after save");

        self.broadcast(vec![
            InvalidationMessage::remove_bulk(warmed),
            InvalidationMessage::purge_namespace(prefix),
        ]);
    }

    /// Mark `instance` as absent after it was deleted
    pub async fn after_destroy(&self, instance: &M) {
        let snapshot = match instance.to_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(model = M::NAME, error = %e, "Failed to snapshot destroyed record, purging namespace");
                self.invalidate_namespace().await;
                return;
            }
        };

        let keys = self.candidate_keys(&snapshot);
        let ttl = self.ttl();
        for key in &keys {
            self.store.delete_remote(key.as_str()).await;
            self.store.set(key.as_str(), None, ttl).await;
        }

        let tombstoned: Vec<String> = keys.into_iter().map(CacheKey::into_string).collect();
        let prefix = self.namespace();
        let purged = self.store.purge_namespace(&prefix, &tombstoned).await;
        debug!(model = M::NAME, tombstoned = tombstoned.len(), purged, "Cache invalidated after destroy");

        self.broadcast(vec![
            InvalidationMessage::remove_bulk(tombstoned),
            InvalidationMessage::purge_namespace(prefix),
        ]);
    }

    pub async fn after_bulk_create(&self) {
        self.invalidate_namespace().await;
    }

    pub async fn after_bulk_update(&self) {
        self.invalidate_namespace().await;
    }

    pub async fn after_bulk_destroy(&self) {
        self.invalidate_namespace().await;
    }

    /// Drop every cached entry of this model, here and on sibling shards
    pub async fn invalidate_namespace(&self) -> usize {
        let prefix = self.namespace();
        let purged = self.store.purge_namespace(&prefix, &[]).await;
        debug!(model = M::NAME, purged, "Model namespace purged");
        self.broadcast(vec![InvalidationMessage::purge_namespace(prefix)]);
        purged
    }

    /// Persist `instance` and refresh its cache entries
    ///
    /// # Errors
    ///
    /// Returns the database error unchanged; the cache is left untouched.
    pub async fn save_and_update_cache(&self, instance: &M) -> Result<M> {
        let saved = self.db.save(instance).await?;
        self.after_save(&saved).await;
        Ok(saved)
    }

    /// Delete `instance` and negative-cache its point keys
    ///
    /// # Errors
    ///
    /// Returns the database error unchanged; the cache is left untouched.
    pub async fn destroy(&self, instance: &M) -> Result<()> {
        self.db.destroy(instance).await?;
        self.after_destroy(instance).await;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the database error unchanged.
    pub async fn bulk_create(&self, instances: Vec<M>) -> Result<Vec<M>> {
        let created = self.db.bulk_create(instances).await?;
        self.after_bulk_create().await;
        Ok(created)
    }

    /// # Errors
    ///
    /// Returns the database error unchanged.
    pub async fn bulk_update(&self, query: &Query, patch: &Value) -> Result<u64> {
        let updated = self.db.bulk_update(query, patch).await?;
        self.after_bulk_update().await;
        Ok(updated)
    }

    /// # Errors
    ///
    /// Returns the database error unchanged.
    pub async fn bulk_destroy(&self, query: &Query) -> Result<u64> {
        let removed = self.db.bulk_destroy(query).await?;
        self.after_bulk_destroy().await;
        Ok(removed)
    }

    /// Sibling shards only diverge while every shard caches in-process.
    fn broadcast(&self, messages: Vec<InvalidationMessage>) {
        if !self.store.is_degraded() {
            return;
        }
        if let Some(publisher) = &self.publisher {
            publisher.broadcast(messages);
        }
    }
}
