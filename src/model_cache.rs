//! Read-Through Accessors
//!
//! Cached counterparts of the ORM's read operations. Every accessor follows
//! the same path:
//!
//! ```text
//! normalize key ──► store.get ──► Hit       → rehydrate, return
//!                        │        Negative  → None
//!                        └──────► Miss      → join flight on key
//!                                              ├─ follower: await leader's outcome
//!                                              └─ leader: DB fetch → store.set → share
//! ```
//!
//! Cache failures never reach the caller; database errors always do. A caller
//! that fetched alone gets the database error unchanged; callers of a shared
//! fetch all get the same [`CacheError::SharedFetch`].

use anyhow::{Result, anyhow};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::coalesce::{FetchOutcome, Flight, FlightLeader, PendingQueries};
use crate::config::{CacheConfig, ModelSettings};
use crate::error::CacheError;
use crate::key::{CacheKey, KeyBody, QueryKind, namespace_prefix, normalize};
use crate::model::{CachedModel, ModelStore};
use crate::query::{Filter, FilterValue, Op, Query};
use crate::store::CacheStore;
use crate::sync::InvalidationPublisher;
use crate::traits::CacheLookup;

/// Per-call read options
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Go straight to the database without reading or writing the cache
    pub bypass_cache: bool,
}

impl ReadOptions {
    #[must_use]
    pub fn uncached() -> Self {
        Self { bypass_cache: true }
    }
}

/// Cache facade for one model
///
/// Created through [`CacheSystem::model`](crate::CacheSystem::model).
pub struct ModelCache<M: CachedModel, S: ModelStore<M>> {
    pub(crate) store: Arc<CacheStore>,
    pub(crate) db: Arc<S>,
    pub(crate) config: Arc<CacheConfig>,
    pub(crate) settings: ModelSettings,
    pub(crate) pending: PendingQueries,
    pub(crate) creating: PendingQueries,
    pub(crate) publisher: Option<Arc<InvalidationPublisher>>,
    _model: PhantomData<fn() -> M>,
}

impl<M: CachedModel, S: ModelStore<M>> ModelCache<M, S> {
    #[must_use]
    pub fn new(
        store: Arc<CacheStore>,
        db: Arc<S>,
        config: Arc<CacheConfig>,
        publisher: Option<Arc<InvalidationPublisher>>,
    ) -> Self {
        Self {
            store,
            db,
            config,
            settings: M::settings(),
            pending: PendingQueries::new(),
            creating: PendingQueries::new(),
            publisher,
            _model: PhantomData,
        }
    }

    /// Cache key of `query` for the given accessor
    #[must_use]
    pub fn key_for(&self, query: &Query, kind: QueryKind) -> CacheKey {
        normalize(&self.config.cache_version, M::NAME, KeyBody::Query(query, kind))
    }

    /// Cache key with a caller-chosen body
    #[must_use]
    pub fn raw_key(&self, body: &str) -> CacheKey {
        normalize(&self.config.cache_version, M::NAME, KeyBody::Raw(body))
    }

    /// Prefix shared by every key of this model
    #[must_use]
    pub fn namespace(&self) -> String {
        namespace_prefix(&self.config.cache_version, M::NAME)
    }

    /// TTL of point and list entries
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.settings.ttl.unwrap_or(self.config.default_ttl)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// The ORM collaborator, for operations the cache does not wrap
    #[must_use]
    pub fn db(&self) -> &Arc<S> {
        &self.db
    }

    /// Callers that joined a fetch already in progress
    #[must_use]
    pub fn coalesced(&self) -> u64 {
        self.pending.coalesced() + self.creating.coalesced()
    }

    /// Keys with a database fetch currently in progress
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len() + self.creating.len()
    }

    /// Cached single-record lookup
    ///
    /// An empty filter returns `None` without touching the cache or database.
    ///
    /// # Errors
    ///
    /// Returns the database error if the lookup had to query it and failed.
    pub async fn get_one(&self, query: &Query) -> Result<Option<M>> {
        self.get_one_with(query, ReadOptions::default()).await
    }

    /// Single-record lookup that always queries the database
    ///
    /// # Errors
    ///
    /// Returns the database error unchanged.
    pub async fn get_one_uncached(&self, query: &Query) -> Result<Option<M>> {
        self.get_one_with(query, ReadOptions::uncached()).await
    }

    /// # Errors
    ///
    /// Returns the database error if the lookup had to query it and failed.
    pub async fn get_one_with(&self, query: &Query, options: ReadOptions) -> Result<Option<M>> {
        if query.is_empty() {
            debug!(model = M::NAME, "get_one called without a filter");
            return Ok(None);
        }
        if options.bypass_cache {
            return self.db.find_one(query).await;
        }

        let key = self.key_for(query, QueryKind::One);
        self.read_through(&key, self.ttl(), M::rehydrate, M::to_snapshot, || {
            self.db.find_one(query)
        })
        .await
    }

    /// Cached list lookup; empty results are cached too
    ///
    /// # Errors
    ///
    /// Returns the database error if the lookup had to query it and failed.
    pub async fn get_all(&self, query: &Query) -> Result<Vec<M>> {
        let key = self.key_for(query, QueryKind::All);
        let items = self
            .read_through(&key, self.ttl(), rehydrate_all::<M>, snapshot_all::<M>, || async {
                self.db.find_all(query).await.map(Some)
            })
            .await?;
        Ok(items.unwrap_or_default())
    }

    /// Cached find-or-create
    ///
    /// A cached instance is returned as `(instance, false)` without touching
    /// the database. Negative markers are ignored since the record may be
    /// about to be created. A created record goes through [`Self::after_save`]
    /// before it is cached under the filter key. Concurrent calls for the
    /// same filter share one database call.
    ///
    /// # Errors
    ///
    /// Returns the database error, shared as [`CacheError::SharedFetch`]
    /// when other callers were waiting on the same call.
    pub async fn find_or_create(&self, query: &Query, defaults: &Value) -> Result<(M, bool)> {
        let key = self.key_for(query, QueryKind::One);

        if let Some(instance) = self.cached_instance(&key).await {
            return Ok((instance, false));
        }

        // Separate from `pending`: a cached absence seen by `get_one` must
        // not answer a find-or-create.
        let leader = loop {
            match self.creating.join(key.as_str()) {
                Flight::Leader(leader) => break leader,
                Flight::Follower(follower) => match follower.outcome().await {
                    Some(FetchOutcome::Fetched(Some(snapshot))) => match M::rehydrate(snapshot) {
                        Ok(instance) => return Ok((instance, false)),
                        Err(e) => warn!(model = M::NAME, key = %key, error = %e, "Shared record failed to rehydrate"),
                    },
                    Some(FetchOutcome::Failed(e)) => return Err(CacheError::SharedFetch(e).into()),
                    _ => {}
                },
            }
            if let Some(instance) = self.cached_instance(&key).await {
                return Ok((instance, false));
            }
        };

        let (instance, created) = match self.db.find_or_create(query, defaults).await {
            Ok(found) => found,
            Err(e) => return Err(fail_flight(leader, e)),
        };
        if created {
            debug!(model = M::NAME, key = %key, "Record created by find_or_create");
            self.after_save(&instance).await;
        }

        match instance.to_snapshot() {
            Ok(snapshot) => {
                self.store.set(key.as_str(), Some(&snapshot), self.ttl()).await;
                leader.complete(FetchOutcome::Fetched(Some(snapshot)));
            }
            Err(e) => {
                warn!(model = M::NAME, key = %key, error = %e, "Failed to snapshot record, not caching");
                leader.complete(FetchOutcome::Unshared);
            }
        }
        Ok((instance, created))
    }

    /// Cached row count, kept for [`CacheConfig::count_ttl`]
    ///
    /// # Errors
    ///
    /// Returns the database error if the count had to query it and failed.
    pub async fn count(&self, query: &Query) -> Result<u64> {
        let key = self.key_for(query, QueryKind::Count);
        let count = self
            .read_through(
                &key,
                self.config.count_ttl,
                |value: Value| value.as_u64().ok_or_else(|| anyhow!("cached count is not an integer")),
                |count: &u64| Ok(Value::from(*count)),
                || async { self.db.count(query).await.map(Some) },
            )
            .await?;
        Ok(count.unwrap_or_default())
    }

    /// Fetch several records by primary key in one query
    ///
    /// Filters that carry no primary key value are skipped. Results are not
    /// cached per record.
    ///
    /// # Errors
    ///
    /// Returns the database error unchanged.
    pub async fn get_batch(&self, filters: &[Filter]) -> Result<Vec<M>> {
        let pk = M::primary_key();
        let mut ids: Vec<FilterValue> = Vec::with_capacity(filters.len());
        for filter in filters {
            match filter.field(pk) {
                Some(id) if !id.is_empty() => {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                _ => debug!(model = M::NAME, "Skipping batch filter without a primary key"),
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::new(Filter::new().cmp(pk, Op::In, FilterValue::Array(ids)));
        self.db.find_all(&query).await
    }

    async fn cached_instance(&self, key: &CacheKey) -> Option<M> {
        match self.lookup(key, &M::rehydrate).await {
            Some(Some(instance)) => Some(instance),
            _ => None,
        }
    }

    /// `Some(None)` is a cached absence, `None` a miss
    async fn lookup<T, D>(&self, key: &CacheKey, decode: &D) -> Option<Option<T>>
    where
        D: Fn(Value) -> Result<T>,
    {
        match self.store.get(key.as_str()).await {
            CacheLookup::Hit(value) => match decode(value) {
                Ok(decoded) => Some(Some(decoded)),
                Err(e) => {
                    warn!(model = M::NAME, key = %key, error = %e, "Discarding cached entry that failed to rehydrate");
                    None
                }
            },
            CacheLookup::Negative => Some(None),
            CacheLookup::Miss => None,
        }
    }

    async fn read_through<T, D, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        decode: D,
        encode: E,
        fetch: F,
    ) -> Result<Option<T>>
    where
        D: Fn(Value) -> Result<T>,
        E: FnOnce(&T) -> Result<Value>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if let Some(cached) = self.lookup(key, &decode).await {
            return Ok(cached);
        }

        let leader = loop {
            match self.pending.join(key.as_str()) {
                Flight::Leader(leader) => break leader,
                Flight::Follower(follower) => match follower.outcome().await {
                    Some(FetchOutcome::Fetched(snapshot)) => match snapshot.map(&decode).transpose() {
                        Ok(shared) => return Ok(shared),
                        Err(e) => warn!(model = M::NAME, key = %key, error = %e, "Shared result failed to rehydrate"),
                    },
                    Some(FetchOutcome::Failed(e)) => return Err(CacheError::SharedFetch(e).into()),
                    // Leader went away or could not share; look again, then lead.
                    Some(FetchOutcome::Unshared) | None => {}
                },
            }
            if let Some(cached) = self.lookup(key, &decode).await {
                return Ok(cached);
            }
        };

        debug!(model = M::NAME, key = %key, "Cache miss, querying database");
        let fresh = match fetch().await {
            Ok(fresh) => fresh,
            Err(e) => return Err(fail_flight(leader, e)),
        };

        let snapshot = match fresh.as_ref().map(encode).transpose() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(model = M::NAME, key = %key, error = %e, "Failed to snapshot result, not caching");
                leader.complete(FetchOutcome::Unshared);
                return Ok(fresh);
            }
        };
        self.store.set(key.as_str(), snapshot.as_ref(), ttl).await;
        leader.complete(FetchOutcome::Fetched(snapshot));
        Ok(fresh)
    }
}

/// Hand a failed fetch to every follower
///
/// The leader keeps the original error when nobody else was waiting.
fn fail_flight(leader: FlightLeader, e: anyhow::Error) -> anyhow::Error {
    let shared = Arc::new(e);
    leader.complete(FetchOutcome::Failed(Arc::clone(&shared)));
    match Arc::try_unwrap(shared) {
        Ok(original) => original,
        Err(shared) => CacheError::SharedFetch(shared).into(),
    }
}

fn rehydrate_all<M: CachedModel>(value: Value) -> Result<Vec<M>> {
    match value {
        Value::Array(items) => items.into_iter().map(M::rehydrate).collect(),
        _ => Err(anyhow!("cached list is not an array")),
    }
}

#[allow(clippy::ptr_arg)]
fn snapshot_all<M: CachedModel>(items: &Vec<M>) -> Result<Value> {
    items
        .iter()
        .map(CachedModel::to_snapshot)
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}
