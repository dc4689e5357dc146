//! Cross-shard cache synchronization
//!
//! While the distributed engine is down every shard caches in its own
//! process, so a write on one shard would leave stale entries on the others.
//! Write hooks therefore broadcast their invalidations to sibling shards,
//! which evict the same keys from their in-process engine.
//!
//! Delivery is best-effort and fire-and-forget: failures are logged, never
//! retried, and never delay or fail the local invalidation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::CacheError;
use crate::store::CacheStore;

/// Invalidation instructions sent to sibling shards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvalidationMessage {
    /// Remove several keys at once
    RemoveBulk { keys: Vec<String> },

    /// Remove every key of one model namespace
    PurgeNamespace { prefix: String },
}

impl InvalidationMessage {
    /// Create a `RemoveBulk` message
    #[must_use]
    pub fn remove_bulk(keys: Vec<String>) -> Self {
        Self::RemoveBulk { keys }
    }

    /// Create a `PurgeNamespace` message
    pub fn purge_namespace(prefix: impl Into<String>) -> Self {
        Self::PurgeNamespace {
            prefix: prefix.into(),
        }
    }
}

/// One broadcast: who sent it, when, and what to evict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEnvelope {
    pub origin: Uuid,
    pub sent_at_ms: u64,
    pub messages: Vec<InvalidationMessage>,
}

impl InvalidationEnvelope {
    #[must_use]
    pub fn new(origin: Uuid, messages: Vec<InvalidationMessage>) -> Self {
        let sent_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        Self {
            origin,
            sent_at_ms: u64::try_from(sent_at_ms).unwrap_or(u64::MAX),
            messages,
        }
    }

    /// Serialize to JSON for transmission
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize invalidation envelope")
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize invalidation envelope")
    }
}

/// Delivery channel to sibling shards
///
/// Implement this over whatever IPC the host uses between shard processes.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Deliver a serialized envelope to every shard, including the sender
    ///
    /// # Errors
    ///
    /// Returns an error if the payload could not be handed to the transport.
    async fn broadcast(&self, payload: String) -> Result<()>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// In-process shard bus over a tokio broadcast channel
///
/// For shards hosted in one process (and for tests).
#[derive(Clone)]
pub struct LocalShardBus {
    sender: broadcast::Sender<String>,
}

impl LocalShardBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// A stream of every payload broadcast after this call
    pub fn subscribe(&self) -> impl Stream<Item = String> + Send + 'static {
        let rx = self.sender.subscribe();
        futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Shard bus subscriber lagged, invalidations dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Default for LocalShardBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ShardTransport for LocalShardBus {
    async fn broadcast(&self, payload: String) -> Result<()> {
        self.sender
            .send(payload)
            .map(|_| ())
            .map_err(|_| CacheError::Broadcast("no shard is listening on the local bus".to_string()).into())
    }

    fn name(&self) -> &'static str {
        "LocalShardBus"
    }
}

/// Statistics for invalidation operations
#[derive(Debug, Default, Clone)]
pub struct InvalidationStats {
    /// Envelopes handed to the transport
    pub messages_sent: u64,
    /// Envelopes the transport refused
    pub send_errors: u64,
    /// Envelopes received from other shards
    pub messages_received: u64,
    /// Envelopes skipped because this shard sent them
    pub own_messages_skipped: u64,
    pub bulk_removes_received: u64,
    pub purges_received: u64,
    /// Payloads that could not be decoded
    pub processing_errors: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
struct AtomicInvalidationStats {
    messages_sent: AtomicU64,
    send_errors: AtomicU64,
    messages_received: AtomicU64,
    own_messages_skipped: AtomicU64,
    bulk_removes_received: AtomicU64,
    purges_received: AtomicU64,
    processing_errors: AtomicU64,
}

impl AtomicInvalidationStats {
    fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            own_messages_skipped: self.own_messages_skipped.load(Ordering::Relaxed),
            bulk_removes_received: self.bulk_removes_received.load(Ordering::Relaxed),
            purges_received: self.purges_received.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle for sending invalidation envelopes
pub struct InvalidationPublisher {
    origin: Uuid,
    transport: Arc<dyn ShardTransport>,
    stats: Arc<AtomicInvalidationStats>,
}

impl InvalidationPublisher {
    #[must_use]
    pub fn new(origin: Uuid, transport: Arc<dyn ShardTransport>) -> Self {
        Self {
            origin,
            transport,
            stats: Arc::new(AtomicInvalidationStats::default()),
        }
    }

    #[must_use]
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Send an envelope and wait for the transport to accept it
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or delivery fails.
    pub async fn publish(&self, messages: Vec<InvalidationMessage>) -> Result<()> {
        Self::send(
            self.origin,
            Arc::clone(&self.transport),
            Arc::clone(&self.stats),
            messages,
        )
        .await
    }

    /// Fire-and-forget send; failures are only logged
    pub fn broadcast(&self, messages: Vec<InvalidationMessage>) {
        if messages.is_empty() {
            return;
        }
        let origin = self.origin;
        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let name = transport.name();
            if let Err(e) = Self::send(origin, transport, stats, messages).await {
                warn!(transport = name, error = %e, "Failed to broadcast cache invalidation to sibling shards");
            }
        });
    }

    async fn send(
        origin: Uuid,
        transport: Arc<dyn ShardTransport>,
        stats: Arc<AtomicInvalidationStats>,
        messages: Vec<InvalidationMessage>,
    ) -> Result<()> {
        let payload = InvalidationEnvelope::new(origin, messages).to_json()?;
        match transport.broadcast(payload).await {
            Ok(()) => {
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }
}

/// Applies envelopes from sibling shards to this shard's in-process engine
///
/// Spawns a background task consuming a payload stream; envelopes sent by
/// this shard are skipped.
pub struct InvalidationSubscriber {
    origin: Uuid,
    store: Arc<CacheStore>,
    stats: Arc<AtomicInvalidationStats>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl InvalidationSubscriber {
    #[must_use]
    pub fn new(origin: Uuid, store: Arc<CacheStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            origin,
            store,
            stats: Arc::new(AtomicInvalidationStats::default()),
            shutdown_tx,
        }
    }

    /// Get a snapshot of current statistics
    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }

    /// Start the subscriber background task
    pub fn start<S>(&self, payloads: S) -> tokio::task::JoinHandle<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let origin = self.origin;
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut payloads = Box::pin(payloads);
            info!(%origin, "Shard invalidation subscriber started");

            loop {
                tokio::select! {
                    payload = payloads.next() => {
                        let Some(payload) = payload else {
                            info!(%origin, "Shard invalidation stream ended");
                            break;
                        };
                        Self::handle_payload(origin, &store, &stats, &payload);
                    }
                    _ = shutdown_rx.recv() => {
                        info!(%origin, "Shard invalidation subscriber shutting down...");
                        break;
                    }
                }
            }
        })
    }

    fn handle_payload(
        origin: Uuid,
        store: &CacheStore,
        stats: &AtomicInvalidationStats,
        payload: &str,
    ) {
        let envelope = match InvalidationEnvelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Dropping malformed shard invalidation payload");
                stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if envelope.origin == origin {
            stats.own_messages_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        stats.messages_received.fetch_add(1, Ordering::Relaxed);

        for message in &envelope.messages {
            match message {
                InvalidationMessage::RemoveBulk { keys } => {
                    stats.bulk_removes_received.fetch_add(1, Ordering::Relaxed);
                    store.evict_local(keys, None);
                }
                InvalidationMessage::PurgeNamespace { prefix } => {
                    stats.purges_received.fetch_add(1, Ordering::Relaxed);
                    store.evict_local(&[], Some(prefix.as_str()));
                }
            }
        }
        debug!(from = %envelope.origin, count = envelope.messages.len(), "Applied shard invalidation");
    }

    /// Signal the subscriber to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
