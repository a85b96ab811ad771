//! In-memory broker
//!
//! Backs the [`Broker`] trait with process-local state for tests and
//! single-node development. Every operation takes the single inner lock,
//! which is what makes `list_claim` and `list_drain_to_front` atomic - the
//! same guarantee a production broker provides through server-side scripts.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::broker::{Broker, StreamEntry, Subscription};
use crate::error::FabricError;

/// Buffered payloads per subscriber before the channel applies back-pressure
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct GroupState {
    /// Index of the next stream entry this group has not yet delivered
    cursor: usize,
    /// Delivered-but-unacked entries: id -> (consumer, delivered_at, payload)
    pending: HashMap<String, (String, Instant, String)>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, StreamState>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

/// Process-local [`Broker`] implementation
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, FabricError> {
        let mut inner = self.inner.lock().await;
        let subs = inner.subscribers.entry(channel.to_string()).or_default();
        // Prune subscribers whose receiver is gone, deliver to the rest
        subs.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subs.iter() {
            if tx.try_send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(channel, delivered, "publish");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, FabricError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().await;
        inner.subscribers.entry(channel.to_string()).or_default().push(tx);
        debug!(channel, "subscribe");
        Ok(Subscription::new(channel, rx))
    }

    async fn list_len(&self, key: &str) -> Result<usize, FabricError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn list_push_back(&self, key: &str, payloads: Vec<String>) -> Result<usize, FabricError> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.extend(payloads);
        Ok(list.len())
    }

    async fn list_push_front(&self, key: &str, payloads: Vec<String>) -> Result<usize, FabricError> {
        let mut inner = self.inner.lock().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        for payload in payloads.into_iter().rev() {
            list.push_front(payload);
        }
        Ok(list.len())
    }

    async fn list_peek(&self, key: &str, n: usize) -> Result<Vec<String>, FabricError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().take(n).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_remove(&self, key: &str, payload: &str) -> Result<usize, FabricError> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        if let Some(pos) = list.iter().position(|p| p == payload) {
            list.remove(pos);
            return Ok(1);
        }
        Ok(0)
    }

    async fn list_claim(&self, src: &str, dst: &str, n: usize) -> Result<Vec<String>, FabricError> {
        // One lock guard spans the pop and the push: the claim is atomic.
        let mut inner = self.inner.lock().await;
        let mut claimed = Vec::new();
        if let Some(list) = inner.lists.get_mut(src) {
            for _ in 0..n {
                match list.pop_front() {
                    Some(payload) => claimed.push(payload),
                    None => break,
                }
            }
        }
        if !claimed.is_empty() {
            let dst_list = inner.lists.entry(dst.to_string()).or_default();
            dst_list.extend(claimed.iter().cloned());
        }
        debug!(src, dst, count = claimed.len(), "list_claim");
        Ok(claimed)
    }

    async fn list_drain_to_front(&self, src: &str, dst: &str) -> Result<usize, FabricError> {
        let mut inner = self.inner.lock().await;
        let drained: Vec<String> = inner
            .lists
            .get_mut(src)
            .map(|l| l.drain(..).collect())
            .unwrap_or_default();
        let count = drained.len();
        if count > 0 {
            let dst_list = inner.lists.entry(dst.to_string()).or_default();
            for payload in drained.into_iter().rev() {
                dst_list.push_front(payload);
            }
        }
        debug!(src, dst, count, "list_drain_to_front");
        Ok(count)
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), FabricError> {
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.lists.get_mut(key) {
            while list.len() > max_len {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn stream_add(&self, stream: &str, payload: String) -> Result<String, FabricError> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        let id = format!("{}-0", state.next_seq);
        state.next_seq += 1;
        state.entries.push(StreamEntry {
            id: id.clone(),
            payload,
        });
        Ok(id)
    }

    async fn group_create(&self, stream: &str, group: &str) -> Result<(), FabricError> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        // Pre-existing groups keep their cursor and pending entries
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, FabricError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self.inner.lock().await;
                let state = inner.streams.entry(stream.to_string()).or_default();
                let group_state = state.groups.get_mut(group).ok_or_else(|| FabricError::NoSuchGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })?;

                let available = state.entries.len().saturating_sub(group_state.cursor);
                if available > 0 {
                    let take = available.min(count);
                    let delivered: Vec<StreamEntry> =
                        state.entries[group_state.cursor..group_state.cursor + take].to_vec();
                    group_state.cursor += take;
                    let now = Instant::now();
                    for entry in &delivered {
                        group_state
                            .pending
                            .insert(entry.id.clone(), (consumer.to_string(), now, entry.payload.clone()));
                    }
                    return Ok(delivered);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn group_ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<bool, FabricError> {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(entry_id).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn group_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>, FabricError> {
        let mut inner = self.inner.lock().await;
        let Some(group_state) = inner.streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, (owner, delivered_at, payload)) in group_state.pending.iter_mut() {
            if now.duration_since(*delivered_at) >= min_idle {
                *owner = consumer.to_string();
                *delivered_at = now;
                claimed.push(StreamEntry {
                    id: id.clone(),
                    payload: payload.clone(),
                });
            }
        }
        // Stable redelivery order regardless of map iteration
        claimed.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(stream, group, consumer, count = claimed.len(), "group_claim_idle");
        Ok(claimed)
    }
}
