//! Durable stream consumer
//!
//! One consumer per daemon process reads its agent's stream through a
//! consumer group. Entries stay pending until acknowledged; a crashed
//! process leaves them pending, and the next startup reclaims everything
//! idle past the threshold.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::{Broker, StreamEntry};
use crate::channels::{consumer_name, group_name, stream_key};
use crate::error::FabricError;

/// How long a delivered entry may sit unacked before another consumer may
/// steal it
pub const REDELIVERY_IDLE: Duration = Duration::from_secs(30);

/// Blocking window for one read call
pub const READ_BLOCK: Duration = Duration::from_secs(5);

/// Max entries per read call
pub const READ_BATCH: usize = 10;

/// Consumer-group reader for one agent's durable stream
pub struct StreamConsumer {
    broker: Arc<dyn Broker>,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    /// Build the consumer for an agent, deriving stream/group/consumer names
    /// from the agent id, type, and process id
    pub fn new(broker: Arc<dyn Broker>, agent_id: &str, agent_type: &str) -> Self {
        Self {
            broker,
            stream: stream_key(&crate::channels::agent_channel(agent_id)),
            group: group_name(agent_type),
            consumer: consumer_name(agent_type, std::process::id()),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group; tolerates a pre-existing group
    pub async fn ensure_group(&self) -> Result<(), FabricError> {
        self.broker.group_create(&self.stream, &self.group).await?;
        debug!(stream = %self.stream, group = %self.group, "Consumer group ready");
        Ok(())
    }

    /// One blocking read of up to [`READ_BATCH`] new entries
    pub async fn read(&self) -> Result<Vec<StreamEntry>, FabricError> {
        self.broker
            .group_read(&self.stream, &self.group, &self.consumer, READ_BATCH, READ_BLOCK)
            .await
    }

    /// Acknowledge one processed entry
    pub async fn ack(&self, entry_id: &str) -> Result<bool, FabricError> {
        self.broker.group_ack(&self.stream, &self.group, entry_id).await
    }

    /// Claim entries another consumer left pending for longer than
    /// [`REDELIVERY_IDLE`]. Called at startup for crash recovery.
    pub async fn reclaim_stale(&self) -> Result<Vec<StreamEntry>, FabricError> {
        let stale = self
            .broker
            .group_claim_idle(&self.stream, &self.group, &self.consumer, REDELIVERY_IDLE)
            .await?;
        if !stale.is_empty() {
            info!(count = stale.len(), stream = %self.stream, "Reclaimed stale stream entries");
        }
        Ok(stale)
    }

    /// Append an entry to another agent's stream
    pub async fn deliver_to(
        broker: &Arc<dyn Broker>,
        agent_id: &str,
        payload: String,
    ) -> Result<String, FabricError> {
        let stream = stream_key(&crate::channels::agent_channel(agent_id));
        broker.stream_add(&stream, payload).await
    }
}
