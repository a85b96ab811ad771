//! Inter-agent message envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Priority;

/// Discriminator for inter-agent messages.
///
/// The decoder is permissive: tags this build does not know about become
/// [`MessageType::Other`] and are routed to an ignored sink with a debug log,
/// preserving forward compatibility across daemon versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MessageType {
    Task,
    StateTask,
    Decision,
    Alert,
    Vote,
    WorkerResult,
    PrApprovedByRag,
    PrReviewAssigned,
    StatusRequest,
    StatusResponse,
    Broadcast,
    TaskQueued,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Task => "task",
            Self::StateTask => "state_task",
            Self::Decision => "decision",
            Self::Alert => "alert",
            Self::Vote => "vote",
            Self::WorkerResult => "worker_result",
            Self::PrApprovedByRag => "pr_approved_by_rag",
            Self::PrReviewAssigned => "pr_review_assigned",
            Self::StatusRequest => "status_request",
            Self::StatusResponse => "status_response",
            Self::Broadcast => "broadcast",
            Self::TaskQueued => "task_queued",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "task" => Self::Task,
            "state_task" => Self::StateTask,
            "decision" => Self::Decision,
            "alert" => Self::Alert,
            "vote" => Self::Vote,
            "worker_result" => Self::WorkerResult,
            "pr_approved_by_rag" => Self::PrApprovedByRag,
            "pr_review_assigned" => Self::PrReviewAssigned,
            "status_request" => Self::StatusRequest,
            "status_response" => Self::StatusResponse,
            "broadcast" => Self::Broadcast,
            "task_queued" => Self::TaskQueued,
            _ => Self::Other(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of inter-agent communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub requires_response: bool,
    /// Trace id propagated through every effect this message causes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    /// Build a message from this agent to a named recipient
    pub fn new(kind: MessageType, from: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            from: from.into(),
            to: to.into(),
            payload,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            requires_response: false,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Trace id of the causal chain: the correlation id when present,
    /// otherwise this message's own id
    pub fn trace_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.id)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Decide whether a message warrants invoking the LLM.
///
/// Work-bearing kinds always do; `status_request` only when the CEO asks;
/// anything at high or urgent priority does regardless of kind.
pub fn should_trigger_ai(msg: &Message) -> bool {
    if matches!(
        msg.kind,
        MessageType::Task
            | MessageType::StateTask
            | MessageType::Decision
            | MessageType::Alert
            | MessageType::Vote
            | MessageType::WorkerResult
            | MessageType::PrApprovedByRag
            | MessageType::PrReviewAssigned
    ) {
        return true;
    }
    if msg.kind == MessageType::StatusRequest && msg.from == "ceo" {
        return true;
    }
    matches!(msg.priority, Priority::High | Priority::Urgent)
}
