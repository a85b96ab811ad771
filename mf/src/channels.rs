//! Channel, stream, and queue key naming
//!
//! Every daemon agrees on these names; they are the only coupling between
//! processes besides the payload schema.

/// Channel every daemon may broadcast to
pub const BROADCAST: &str = "broadcast";

/// Channel the orchestrator listens on for task routing
pub const ORCHESTRATOR: &str = "orchestrator";

/// Private channel of one agent
pub fn agent_channel(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// Shared channel of a tier ("head" or "clevel")
pub fn tier_channel(tier: &str) -> String {
    tier.to_string()
}

/// Durable stream mirroring a pub/sub channel
pub fn stream_key(channel: &str) -> String {
    format!("stream:{}", channel)
}

/// Consumer group for one agent type
pub fn group_name(agent_type: &str) -> String {
    format!("agent-{}", agent_type)
}

/// Consumer name within the group, unique per process
pub fn consumer_name(agent_type: &str, pid: u32) -> String {
    format!("{}-{}", agent_type, pid)
}

/// Pending task list for one agent type
pub fn pending_key(agent_type: &str) -> String {
    format!("queue:tasks:{}", agent_type)
}

/// In-flight mirror of the pending list
pub fn processing_key(agent_type: &str) -> String {
    format!("{}:processing", pending_key(agent_type))
}

/// Dead-letter list for actions that exhausted their retries
pub fn dead_letter_key(agent_type: &str) -> String {
    format!("queue:dead:{}", agent_type)
}
