//! Local Cache - In-Process Fallback Backend
//!
//! A bounded in-memory map used whenever the distributed engine is not
//! available.
//!
//! - Eviction is strictly by insertion order: when the map is full, inserting a
//!   new key drops the oldest-inserted key. Re-setting an existing key keeps its
//!   original position.
//! - Negative markers live in a separate queue with the same bound, so that
//!   "known absent" never pushes real values out.
//! - Expiry is lazy: expired entries are dropped when read.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::traits::{CacheBackend, CacheLookup};

/// Cache slot with expiration tracking
#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: Instant,
    /// Insertion sequence, matched against the order queue on eviction
    seq: u64,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Map bounded by insertion order
#[derive(Debug)]
struct FifoMap<V> {
    slots: HashMap<String, Slot<V>>,
    /// Insertion order; may hold stale `(seq, key)` pairs for removed keys
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl<V> Default for FifoMap<V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }
}

impl<V> FifoMap<V> {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert or overwrite `key`; returns the keys evicted to make room
    fn insert(&mut self, key: &str, value: V, expires_at: Instant, capacity: usize) -> Vec<String> {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.value = value;
            slot.expires_at = expires_at;
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.slots.len() >= capacity {
            match self.evict_oldest() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(key.to_string(), Slot { value, expires_at, seq });
        self.order.push_back((seq, key.to_string()));
        self.compact_order(capacity);
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    fn retain(&mut self, keep: impl Fn(&String) -> bool, capacity: usize) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, _| keep(key));
        self.compact_order(capacity);
        before - self.slots.len()
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }

    fn evict_oldest(&mut self) -> Option<String> {
        while let Some((seq, key)) = self.order.pop_front() {
            let live = self.slots.get(&key).is_some_and(|slot| slot.seq == seq);
            if live {
                self.slots.remove(&key);
                return Some(key);
            }
        }
        None
    }

    /// Drop stale order slots once they outnumber live entries.
    fn compact_order(&mut self, capacity: usize) {
        if self.order.len() <= capacity.saturating_mul(2).saturating_add(16) {
            return;
        }
        let slots = &self.slots;
        self.order
            .retain(|(seq, key)| slots.get(key).is_some_and(|slot| slot.seq == *seq));
    }
}

#[derive(Debug, Default)]
struct LocalState {
    entries: FifoMap<serde_json::Value>,
    negatives: FifoMap<()>,
}

/// Snapshot of local engine counters
#[derive(Debug, Clone, Default)]
pub struct LocalCacheStats {
    pub entries: usize,
    pub negatives: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

/// Bounded, insertion-ordered in-process cache
///
/// **Features**:
/// - FIFO eviction at a fixed entry count
/// - Per-key absolute expiry
/// - Negative markers tracked apart from values
///
/// **Example**:
/// ```rust
/// use hybrid_model_cache::backends::LocalCache;
/// use hybrid_model_cache::CacheLookup;
/// use std::time::Duration;
///
/// let cache = LocalCache::new(2);
/// let ttl = Duration::from_secs(60);
/// cache.set("a", Some(serde_json::json!(1)), ttl);
/// cache.set("b", Some(serde_json::json!(2)), ttl);
/// cache.set("c", Some(serde_json::json!(3)), ttl);
///
/// assert_eq!(cache.get("a"), CacheLookup::Miss);
/// assert_eq!(cache.get("c"), CacheLookup::Hit(serde_json::json!(3)));
/// ```
pub struct LocalCache {
    state: Mutex<LocalState>,
    capacity: usize,
    /// Hit counter
    hits: AtomicU64,
    /// Miss counter
    misses: AtomicU64,
    /// Set counter
    sets: AtomicU64,
    /// Eviction counter
    evictions: AtomicU64,
}

impl LocalCache {
    /// Create a local cache holding at most `capacity` values
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, "Initializing local in-process cache");

        Self {
            state: Mutex::new(LocalState::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Read an entry; expired values are dropped and reported as misses.
    pub fn get(&self, key: &str) -> CacheLookup {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(expired) = state.negatives.slots.get(key).map(|slot| slot.is_expired(now)) {
            if expired {
                state.negatives.remove(key);
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Negative;
            }
        }

        let cached = state
            .entries
            .slots
            .get(key)
            .map(|slot| (slot.is_expired(now), slot.value.clone()));
        let lookup = match cached {
            Some((true, _)) => {
                state.entries.remove(key);
                CacheLookup::Miss
            }
            Some((false, value)) => CacheLookup::Hit(value),
            None => CacheLookup::Miss,
        };
        drop(state);

        if lookup.is_hit() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        lookup
    }

    /// Store a value, or a negative marker when `value` is `None`
    pub fn set(&self, key: &str, value: Option<serde_json::Value>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut state = self.state.lock();
        self.sets.fetch_add(1, Ordering::Relaxed);

        let evicted = match value {
            Some(value) => {
                state.negatives.remove(key);
                state.entries.insert(key, value, expires_at, self.capacity)
            }
            None => {
                state.entries.remove(key);
                state.negatives.insert(key, (), expires_at, self.capacity)
            }
        };
        drop(state);

        for key in &evicted {
            debug!(key = %key, "[Local] Evicted oldest entry");
        }
        self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(key = %key, ttl_ms = ttl.as_millis(), "[Local] Cached key with TTL");
    }

    /// Remove a value and any negative marker for `key`
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        state.entries.remove(key);
        state.negatives.remove(key);
    }

    /// Remove every key starting with `prefix`, keeping the keys in `except`
    pub fn purge_prefix(&self, prefix: &str, except: &[String]) -> usize {
        let keep = |key: &String| !key.starts_with(prefix) || except.contains(key);
        let mut state = self.state.lock();

        let removed = state.entries.retain(keep, self.capacity) + state.negatives.retain(keep, self.capacity);
        drop(state);

        debug!(prefix = %prefix, removed, "[Local] Purged namespace");
        removed
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.negatives.clear();
    }

    /// Number of stored values (negative markers excluded)
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.entries.is_empty() && state.negatives.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn stats(&self) -> LocalCacheStats {
        let state = self.state.lock();
        LocalCacheStats {
            entries: state.entries.len(),
            negatives: state.negatives.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// ===== Trait Implementations =====

use async_trait::async_trait;

/// Implement `CacheBackend` trait for `LocalCache`
///
/// Never fails; lets the local engine stand in wherever a backend is expected.
#[async_trait]
impl CacheBackend for LocalCache {
    async fn get(&self, key: &str) -> Result<CacheLookup> {
        Ok(LocalCache::get(self, key))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Option<&serde_json::Value>,
        ttl: Duration,
    ) -> Result<()> {
        LocalCache::set(self, key, value.cloned(), ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        LocalCache::remove(self, key);
        Ok(())
    }

    async fn purge_prefix(&self, prefix: &str, except: &[String]) -> Result<usize> {
        Ok(LocalCache::purge_prefix(self, prefix, except))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Local"
    }
}
