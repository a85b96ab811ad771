//! Per-agent task queue with atomic claim/ack/recover
//!
//! The pending list is the FIFO of work addressed to one agent type; the
//! processing list mirrors whatever a loop has claimed but not yet finished.
//! A task is either pending or processing, never both and never neither,
//! across a successful claim. Orphans left in processing by a crashed loop
//! are requeued to the head of pending at startup.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::channels::{pending_key, processing_key};
use crate::error::FabricError;

/// A claimed queue entry: the raw payload (needed for the exact-match ack)
/// together with its decoded form
#[derive(Debug, Clone)]
pub struct Claimed<T> {
    pub raw: String,
    pub item: T,
}

/// Handle to one agent type's pending/processing list pair
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    pending: String,
    processing: String,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, agent_type: &str) -> Self {
        Self {
            broker,
            pending: pending_key(agent_type),
            processing: processing_key(agent_type),
        }
    }

    /// Atomically move up to `n` entries from the head of pending into
    /// processing and decode them.
    ///
    /// Payloads that fail to decode are discarded from processing with a
    /// warning so a poison entry cannot wedge the queue forever.
    pub async fn claim<T: DeserializeOwned>(&self, n: usize) -> Result<Vec<Claimed<T>>, FabricError> {
        let raws = self.broker.list_claim(&self.pending, &self.processing, n).await?;
        debug!(count = raws.len(), "claim");

        let mut claimed = Vec::with_capacity(raws.len());
        for raw in raws {
            match serde_json::from_str::<T>(&raw) {
                Ok(item) => claimed.push(Claimed { raw, item }),
                Err(e) => {
                    warn!(error = %e, "Discarding malformed queue payload");
                    self.broker.list_remove(&self.processing, &raw).await?;
                }
            }
        }
        Ok(claimed)
    }

    /// Remove exactly the claimed entries from the processing list
    pub async fn ack<T>(&self, entries: &[Claimed<T>]) -> Result<(), FabricError> {
        for entry in entries {
            let removed = self.broker.list_remove(&self.processing, &entry.raw).await?;
            if removed == 0 {
                warn!("Ack of entry not present in processing list");
            }
        }
        debug!(count = entries.len(), "ack");
        Ok(())
    }

    /// Requeue orphaned processing entries to the head of pending,
    /// preserving order. Called once at daemon startup.
    pub async fn recover(&self) -> Result<usize, FabricError> {
        let recovered = self.broker.list_drain_to_front(&self.processing, &self.pending).await?;
        if recovered > 0 {
            debug!(recovered, "Recovered orphaned tasks into pending");
        }
        Ok(recovered)
    }

    /// Number of pending entries
    pub async fn count(&self) -> Result<usize, FabricError> {
        self.broker.list_len(&self.pending).await
    }

    /// Number of in-flight entries (diagnostics only)
    pub async fn processing_count(&self) -> Result<usize, FabricError> {
        self.broker.list_len(&self.processing).await
    }

    /// Peek the first `n` pending payloads without claiming them
    pub async fn peek(&self, n: usize) -> Result<Vec<String>, FabricError> {
        self.broker.list_peek(&self.pending, n).await
    }

    /// Append a payload to another agent type's pending list and report its
    /// new length. Used when routing work to a different agent.
    pub async fn enqueue_for(
        broker: &Arc<dyn Broker>,
        agent_type: &str,
        payload: String,
    ) -> Result<usize, FabricError> {
        broker.list_push_back(&pending_key(agent_type), vec![payload]).await
    }
}
