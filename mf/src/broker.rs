//! Broker trait - the seam to the shared message medium
//!
//! Everything a daemon needs from the broker is expressed here: fire-and-forget
//! pub/sub, FIFO lists with an atomic head-move (the primitive behind task
//! claiming), and consumer-group streams with pending-entry tracking.
//!
//! A production implementation backs these onto a real broker where the
//! list claim runs as a server-side script; [`crate::MemoryBroker`] performs
//! the same operations under a single lock.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::FabricError;

/// One durable stream entry, pending until acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Broker-assigned entry id, monotonic within the stream
    pub id: String,
    /// Opaque payload (JSON-encoded message)
    pub payload: String,
}

/// Receiving half of a pub/sub subscription
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Channel this subscription is bound to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next published payload; `None` once the broker drops the channel
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for drain loops in tests
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// The shared broker every daemon talks to
#[async_trait]
pub trait Broker: Send + Sync {
    // === Pub/sub (best-effort) ===

    /// Publish to a channel; returns the number of subscribers reached
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, FabricError>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription, FabricError>;

    // === Lists (work queues) ===

    /// Length of a list
    async fn list_len(&self, key: &str) -> Result<usize, FabricError>;

    /// Append payloads to the tail of a list
    async fn list_push_back(&self, key: &str, payloads: Vec<String>) -> Result<usize, FabricError>;

    /// Prepend payloads to the head of a list, preserving their order
    async fn list_push_front(&self, key: &str, payloads: Vec<String>) -> Result<usize, FabricError>;

    /// Read up to `n` entries from the head without removing them
    async fn list_peek(&self, key: &str, n: usize) -> Result<Vec<String>, FabricError>;

    /// Remove one occurrence of an exact payload; returns how many were removed
    async fn list_remove(&self, key: &str, payload: &str) -> Result<usize, FabricError>;

    /// Atomically pop up to `n` entries from the head of `src` and append them
    /// to `dst`. No entry may be observable in neither list.
    async fn list_claim(&self, src: &str, dst: &str, n: usize) -> Result<Vec<String>, FabricError>;

    /// Atomically drain all of `src` onto the head of `dst`, preserving order;
    /// returns the number moved
    async fn list_drain_to_front(&self, src: &str, dst: &str) -> Result<usize, FabricError>;

    /// Trim a list to at most `max_len` entries, dropping from the head
    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), FabricError>;

    // === Streams (durable, at-least-once) ===

    /// Append an entry; returns its id
    async fn stream_add(&self, stream: &str, payload: String) -> Result<String, FabricError>;

    /// Create a consumer group. Idempotent: a pre-existing group is tolerated.
    async fn group_create(&self, stream: &str, group: &str) -> Result<(), FabricError>;

    /// Read up to `count` new entries for `consumer`, blocking up to `block`.
    /// Delivered entries become pending until acknowledged.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, FabricError>;

    /// Acknowledge a delivered entry; returns false when it was not pending
    async fn group_ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<bool, FabricError>;

    /// Claim pending entries idle for at least `min_idle` onto `consumer`
    async fn group_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>, FabricError>;
}
