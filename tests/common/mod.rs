//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - An in-memory `ModelStore` that counts queries
//! - A distributed-backend double that can be switched to failing
//! - Test models and cache system constructors

#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use hybrid_model_cache::{
    CacheBackend, CacheConfig, CacheLookup, CacheSystem, CachedModel, EngineHealth, Filter,
    FilterKey, FilterValue, LocalCache, ModelSettings, ModelStore, Op, Query, RetryPolicy,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

pub fn init_test_tracing() {
    hybrid_model_cache::logging::init_tracing("hybrid_model_cache=debug");
}

/// Config with fast retries so fallback tests finish quickly
pub fn test_config() -> CacheConfig {
    CacheConfig {
        retry: RetryPolicy {
            max_retries: 3,
            step: Duration::from_millis(20),
            cap: Duration::from_millis(100),
        },
        ..CacheConfig::default()
    }
}

/// Cache system running on the in-process engine only
pub async fn local_system(config: CacheConfig) -> CacheSystem {
    CacheSystem::new(config)
        .await
        .unwrap_or_else(|_| panic!("Failed to build cache system"))
}

/// Cache system whose distributed engine is `remote`
pub async fn remote_system(config: CacheConfig, remote: Arc<FlakyRemote>) -> CacheSystem {
    CacheSystem::builder(config)
        .with_remote(remote)
        .with_health(EngineHealth::new())
        .build()
        .await
        .unwrap_or_else(|_| panic!("Failed to build cache system"))
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}

pub fn by_id(id: i64) -> Query {
    Query::new(Filter::new().eq("id", id))
}

pub fn by_member(guild_id: &str, user_id: &str) -> Query {
    Query::new(Filter::new().eq("guild_id", guild_id).eq("user_id", user_id))
}

pub fn by_guild(guild_id: &str) -> Query {
    Query::new(Filter::new().eq("guild_id", guild_id))
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLevel {
    pub id: i64,
    pub guild_id: String,
    pub user_id: String,
    pub xp: i64,
}

impl UserLevel {
    pub fn new(id: i64, guild_id: &str, user_id: &str, xp: i64) -> Self {
        Self {
            id,
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            xp,
        }
    }
}

impl CachedModel for UserLevel {
    const NAME: &'static str = "UserLevel";

    fn settings() -> ModelSettings {
        ModelSettings::default().with_alternate_key(&["guild_id", "user_id"])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub position: u32,
}

/// Model with a nested collection rebuilt by a custom rehydration hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl CachedModel for Playlist {
    const NAME: &'static str = "Playlist";

    fn rehydrate(mut snapshot: Value) -> Result<Self> {
        let tracks = snapshot
            .as_object_mut()
            .and_then(|object| object.remove("tracks"))
            .unwrap_or_else(|| json!([]));

        let mut playlist: Playlist = serde_json::from_value(snapshot)?;
        let mut tracks: Vec<Track> = serde_json::from_value(tracks)?;
        tracks.sort_by_key(|track| track.position);
        playlist.tracks = tracks;
        Ok(playlist)
    }
}

pub fn sample_playlist(id: i64) -> Playlist {
    Playlist {
        id,
        owner_id: "u1".to_string(),
        name: format!("Mix {id}"),
        tracks: vec![
            Track {
                title: "Intro".to_string(),
                position: 1,
            },
            Track {
                title: "Outro".to_string(),
                position: 2,
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// In-memory ORM
// ---------------------------------------------------------------------------

/// Query counters of a [`MemoryStore`]
#[derive(Debug, Default)]
pub struct QueryCounters {
    pub find_one: AtomicUsize,
    pub find_all: AtomicUsize,
    pub find_or_create: AtomicUsize,
    pub count: AtomicUsize,
    pub writes: AtomicUsize,
}

/// In-memory `ModelStore` that records how often it is queried
pub struct MemoryStore<M> {
    rows: Mutex<Vec<M>>,
    next_id: AtomicI64,
    delay: Mutex<Duration>,
    failing: AtomicBool,
    pub calls: QueryCounters,
}

impl<M: CachedModel> MemoryStore<M> {
    pub fn new() -> Self {
        Self::with_rows(Vec::new())
    }

    pub fn with_rows(rows: Vec<M>) -> Self {
        Self {
            rows: Mutex::new(rows),
            next_id: AtomicI64::new(1000),
            delay: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            calls: QueryCounters::default(),
        }
    }

    /// Simulated query latency
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Make every query fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn find_one_calls(&self) -> usize {
        self.calls.find_one.load(Ordering::SeqCst)
    }

    pub fn find_all_calls(&self) -> usize {
        self.calls.find_all.load(Ordering::SeqCst)
    }

    pub fn find_or_create_calls(&self) -> usize {
        self.calls.find_or_create.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.calls.count.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<M> {
        self.rows.lock().clone()
    }

    async fn simulate(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("database unavailable"));
        }
        Ok(())
    }

    fn matching(&self, query: &Query) -> Vec<M> {
        self.rows
            .lock()
            .iter()
            .filter(|row| matches(*row, &query.filter))
            .cloned()
            .collect()
    }
}

impl<M: CachedModel> Default for MemoryStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn primary_key_of<M: CachedModel>(row: &M) -> Option<Value> {
    row.to_snapshot().ok()?.get(M::primary_key()).cloned()
}

fn matches<M: CachedModel>(row: &M, filter: &Filter) -> bool {
    let Ok(snapshot) = row.to_snapshot() else {
        return false;
    };
    filter.entries().iter().all(|(key, expected)| match key {
        FilterKey::Field(name) => field_matches(snapshot.get(name), expected),
        FilterKey::Op(_) => false,
    })
}

fn field_matches(actual: Option<&Value>, expected: &FilterValue) -> bool {
    match expected {
        FilterValue::Object(ops) => ops.iter().all(|(op, operand)| match op {
            FilterKey::Op(Op::Eq) => actual == Some(&to_json(operand)),
            FilterKey::Op(Op::In) => match to_json(operand) {
                Value::Array(items) => actual.is_some_and(|value| items.contains(value)),
                _ => false,
            },
            FilterKey::Op(Op::Gt) => {
                match (actual.and_then(Value::as_f64), to_json(operand).as_f64()) {
                    (Some(a), Some(b)) => a > b,
                    _ => false,
                }
            }
            _ => false,
        }),
        other => actual == Some(&to_json(other)),
    }
}

fn to_json(value: &FilterValue) -> Value {
    match value {
        FilterValue::Null => Value::Null,
        FilterValue::Bool(b) => Value::Bool(*b),
        FilterValue::Number(n) => Value::Number(n.clone()),
        FilterValue::String(s) => Value::String(s.clone()),
        FilterValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        FilterValue::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.token().into_owned(), to_json(value)))
                .collect(),
        ),
    }
}

fn merge(target: &mut Map<String, Value>, patch: &Value) {
    if let Value::Object(fields) = patch {
        for (name, value) in fields {
            target.insert(name.clone(), value.clone());
        }
    }
}

#[async_trait]
impl<M: CachedModel> ModelStore<M> for MemoryStore<M> {
    async fn find_one(&self, query: &Query) -> Result<Option<M>> {
        self.simulate(&self.calls.find_one).await?;
        Ok(self.matching(query).into_iter().next())
    }

    async fn find_all(&self, query: &Query) -> Result<Vec<M>> {
        self.simulate(&self.calls.find_all).await?;
        Ok(self.matching(query))
    }

    async fn find_or_create(&self, query: &Query, defaults: &Value) -> Result<(M, bool)> {
        self.simulate(&self.calls.find_or_create).await?;
        if let Some(found) = self.matching(query).into_iter().next() {
            return Ok((found, false));
        }

        let mut fields = Map::new();
        fields.insert(
            M::primary_key().to_string(),
            json!(self.next_id.fetch_add(1, Ordering::SeqCst)),
        );
        merge(&mut fields, defaults);
        for (key, value) in query.filter.entries() {
            if let Some(name) = key.as_field() {
                fields.insert(name.to_string(), to_json(value));
            }
        }

        let created = M::rehydrate(Value::Object(fields))?;
        self.rows.lock().push(created.clone());
        Ok((created, true))
    }

    async fn count(&self, query: &Query) -> Result<u64> {
        self.simulate(&self.calls.count).await?;
        Ok(self.matching(query).len() as u64)
    }

    async fn save(&self, instance: &M) -> Result<M> {
        self.simulate(&self.calls.writes).await?;
        let pk = primary_key_of(instance);
        let mut rows = self.rows.lock();
        match rows.iter().position(|row| primary_key_of(row) == pk) {
            Some(index) => {
                if let Some(slot) = rows.get_mut(index) {
                    *slot = instance.clone();
                }
            }
            None => rows.push(instance.clone()),
        }
        Ok(instance.clone())
    }

    async fn destroy(&self, instance: &M) -> Result<()> {
        self.simulate(&self.calls.writes).await?;
        let pk = primary_key_of(instance);
        self.rows.lock().retain(|row| primary_key_of(row) != pk);
        Ok(())
    }

    async fn bulk_create(&self, instances: Vec<M>) -> Result<Vec<M>> {
        self.simulate(&self.calls.writes).await?;
        self.rows.lock().extend(instances.iter().cloned());
        Ok(instances)
    }

    async fn bulk_update(&self, query: &Query, patch: &Value) -> Result<u64> {
        self.simulate(&self.calls.writes).await?;
        let mut rows = self.rows.lock();
        let mut updated = 0;
        for row in rows.iter_mut() {
            if !matches(row, &query.filter) {
                continue;
            }
            let Value::Object(mut fields) = row.to_snapshot()? else {
                continue;
            };
            merge(&mut fields, patch);
            *row = M::rehydrate(Value::Object(fields))?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn bulk_destroy(&self, query: &Query) -> Result<u64> {
        self.simulate(&self.calls.writes).await?;
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|row| !matches(row, &query.filter));
        Ok((before - rows.len()) as u64)
    }
}

pub fn seed_levels() -> Vec<UserLevel> {
    vec![
        UserLevel::new(1, "g1", "u1", 100),
        UserLevel::new(2, "g1", "u2", 250),
        UserLevel::new(3, "g2", "u1", 40),
        UserLevel::new(4, "g2", "u3", 5),
    ]
}

// ---------------------------------------------------------------------------
// Distributed engine double
// ---------------------------------------------------------------------------

/// Distributed backend stand-in that fails on demand
pub struct FlakyRemote {
    inner: LocalCache,
    failing: AtomicBool,
    pub operations: AtomicUsize,
}

impl FlakyRemote {
    pub fn new() -> Self {
        Self {
            inner: LocalCache::new(10_000),
            failing: AtomicBool::new(false),
            operations: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let remote = Self::new();
        remote.set_failing(true);
        remote
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn check(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(anyhow!("connection refused"))
        } else {
            Ok(())
        }
    }
}

impl Default for FlakyRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for FlakyRemote {
    async fn get(&self, key: &str) -> Result<CacheLookup> {
        self.check()?;
        Ok(self.inner.get(key))
    }

    async fn set_with_ttl(&self, key: &str, value: Option<&Value>, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.set(key, value.cloned(), ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key);
        Ok(())
    }

    async fn purge_prefix(&self, prefix: &str, except: &[String]) -> Result<usize> {
        self.check()?;
        Ok(self.inner.purge_prefix(prefix, except))
    }

    async fn health_check(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "FlakyRemote"
    }
}
