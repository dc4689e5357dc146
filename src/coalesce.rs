//! Request coalescing
//!
//! Collapses concurrent identical cache misses into a single database fetch.
//! The first caller for a key becomes the leader and fetches; everyone who
//! arrives while the fetch is running follows it and receives the leader's
//! outcome, success or failure, without querying the database again.
//!
//! Outcomes travel as JSON snapshots so one registry serves every accessor
//! of a model regardless of its result type.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

type Slot = Arc<watch::Sender<Option<FetchOutcome>>>;

/// Result of a leader's fetch, as seen by its followers
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Snapshot of the fetched result; `None` for a missing record
    Fetched(Option<Value>),
    /// The database call failed; every follower gets the same error
    Failed(Arc<anyhow::Error>),
    /// The result could not be snapshotted; followers fetch for themselves
    Unshared,
}

/// Outcome of [`PendingQueries::join`]
pub enum Flight {
    Leader(FlightLeader),
    Follower(FlightFollower),
}

/// Held by the caller that performs the fetch
///
/// Removes the registry entry when dropped, even on early return or panic,
/// but only if the entry still belongs to this flight. Followers of a leader
/// dropped without [`FlightLeader::complete`] see the flight end with no
/// outcome.
pub struct FlightLeader {
    map: Arc<DashMap<String, Slot>>,
    key: String,
    slot: Slot,
}

impl FlightLeader {
    /// Publish the outcome to every follower and end the flight
    pub fn complete(self, outcome: FetchOutcome) {
        self.slot.send_replace(Some(outcome));
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        let slot = &self.slot;
        self.map.remove_if(&self.key, |_, current| Arc::ptr_eq(current, slot));
    }
}

/// Handle of a caller waiting on someone else's fetch
pub struct FlightFollower {
    rx: watch::Receiver<Option<FetchOutcome>>,
}

impl FlightFollower {
    /// Wait for the leader; `None` if it went away without an outcome
    pub async fn outcome(mut self) -> Option<FetchOutcome> {
        self.rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|current| current.clone())
    }
}

/// Per-model registry of in-flight fetches keyed by cache key
#[derive(Default)]
pub struct PendingQueries {
    in_flight: Arc<DashMap<String, Slot>>,
    coalesced: AtomicU64,
}

impl PendingQueries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead the fetch for `key`, or follow the one already running
    pub fn join(&self, key: &str) -> Flight {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                Flight::Follower(FlightFollower {
                    rx: entry.get().subscribe(),
                })
            }
            Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(None);
                let slot = Arc::new(tx);
                entry.insert(Arc::clone(&slot));
                Flight::Leader(FlightLeader {
                    map: Arc::clone(&self.in_flight),
                    key: key.to_string(),
                    slot,
                })
            }
        }
    }

    /// Number of keys with a fetch in progress
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Callers that found a fetch already in progress
    #[must_use]
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}
