//! Engine health tracking
//!
//! [`EngineHealth`] is the single flag deciding which engine the store router
//! uses. It is an explicit, cloneable handle rather than hidden global state:
//! every store built from the same handle shares the flag, and tests can
//! flip it deterministically with [`EngineHealth::force`].

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::backends::LocalCache;
use crate::config::RetryPolicy;
use crate::traits::CacheBackend;

#[derive(Debug, Default)]
struct HealthInner {
    connected: AtomicBool,
    recovering: AtomicBool,
    demotions: AtomicU64,
    reconnects: AtomicU64,
}

/// Shared reachability flag of the distributed engine
///
/// Starts disconnected; becomes connected once the engine is reached.
#[derive(Debug, Clone, Default)]
pub struct EngineHealth {
    inner: Arc<HealthInner>,
}

impl EngineHealth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns `true` if this call moved the flag from disconnected to connected.
    pub fn mark_connected(&self) -> bool {
        let was = self.inner.connected.swap(true, Ordering::AcqRel);
        if !was {
            self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        !was
    }

    /// Returns `true` if this call moved the flag from connected to disconnected.
    pub fn mark_disconnected(&self) -> bool {
        let was = self.inner.connected.swap(false, Ordering::AcqRel);
        if was {
            self.inner.demotions.fetch_add(1, Ordering::Relaxed);
        }
        was
    }

    /// Set the flag without touching counters
    pub fn force(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }

    /// Connected → disconnected transitions observed so far
    #[must_use]
    pub fn demotions(&self) -> u64 {
        self.inner.demotions.load(Ordering::Relaxed)
    }

    /// Disconnected → connected transitions observed so far
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.inner.recovering.load(Ordering::Acquire)
    }

    fn try_begin_recovery(&self) -> bool {
        self.inner
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_recovery(&self) {
        self.inner.recovering.store(false, Ordering::Release);
    }
}

/// Invalidations the distributed engine missed while it was not in use
///
/// Entries cached there before the outage may have been overwritten in the
/// database since; they are removed before the engine serves reads again.
#[derive(Debug, Default)]
pub struct RemoteBacklog {
    inner: Mutex<Pending>,
}

#[derive(Debug, Default)]
struct Pending {
    keys: HashSet<String>,
    prefixes: HashSet<String>,
}

impl RemoteBacklog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_key(&self, key: &str) {
        let mut pending = self.inner.lock();
        if !pending.prefixes.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            pending.keys.insert(key.to_string());
        }
    }

    /// A purged prefix supersedes every pending key under it
    pub fn record_prefix(&self, prefix: &str) {
        let mut pending = self.inner.lock();
        pending.keys.retain(|key| !key.starts_with(prefix));
        pending.prefixes.insert(prefix.to_string());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let pending = self.inner.lock();
        pending.keys.is_empty() && pending.prefixes.is_empty()
    }

    /// Namespaces waiting to be purged on the distributed engine
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.inner.lock().prefixes.iter().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Apply the backlog to `remote`
    ///
    /// Whatever fails stays recorded for the next attempt.
    pub async fn replay(&self, remote: &dyn CacheBackend) -> bool {
        let Pending { keys, prefixes } = std::mem::take(&mut *self.inner.lock());
        let mut complete = true;

        for prefix in prefixes {
            if let Err(e) = remote.purge_prefix(&prefix, &[]).await {
                debug!(backend = remote.name(), prefix = %prefix, error = %e, "Backlog purge failed");
                self.record_prefix(&prefix);
                complete = false;
            }
        }
        for key in keys {
            if let Err(e) = remote.remove(&key).await {
                debug!(backend = remote.name(), key = %key, error = %e, "Backlog remove failed");
                self.record_key(&key);
                complete = false;
            }
        }
        complete
    }
}

/// Spawn a background task that pings the distributed engine until it
/// answers or the retry budget runs out.
///
/// On success the backlog of missed invalidations is replayed on the
/// distributed engine, the in-process engine is cleared (its entries were
/// written while the distributed engine was unreachable) and the flag is
/// restored. Does nothing if a recovery task is already running or no tokio
/// runtime is available.
pub(crate) fn spawn_recovery(
    health: &EngineHealth,
    remote: Arc<dyn CacheBackend>,
    local: Arc<LocalCache>,
    backlog: Arc<RemoteBacklog>,
    retry: RetryPolicy,
) {
    if !health.try_begin_recovery() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        health.end_recovery();
        return;
    };

    let health = health.clone();
    runtime.spawn(async move {
        let attempts = retry.max_retries.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(retry.backoff(attempt)).await;

            if health.is_connected() {
                // Someone else restored it (e.g. forced in tests).
                health.end_recovery();
                return;
            }

            if remote.health_check().await && backlog.replay(remote.as_ref()).await {
                local.clear();
                health.mark_connected();
                // Writes that raced the flag flip still went to the local engine.
                if !backlog.replay(remote.as_ref()).await {
                    warn!(backend = remote.name(), "Some missed invalidations could not be replayed");
                }
                health.end_recovery();
                info!(backend = remote.name(), attempt, "Distributed cache engine reconnected");
                return;
            }
            debug!(backend = remote.name(), attempt, "Distributed cache engine still unreachable");
        }

        warn!(
            backend = remote.name(),
            attempts,
            "Giving up on distributed cache engine, staying on in-process cache"
        );
        health.end_recovery();
    });
}
