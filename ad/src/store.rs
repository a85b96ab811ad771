//! Relational store seam
//!
//! The real store is an external collaborator; the daemon only depends on
//! this trait. The layout mirrors the persisted schema: agents, agent_state
//! (partitioned by agent id), history, events, decisions, settings, audit.
//! [`MemoryStore`] backs tests and single-node development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from the relational store, the RAG store, or the issue tracker
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Agent not found for type '{0}'")]
    AgentNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One history row appended after each loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub agent_id: String,
    pub action_type: String,
    pub summary: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// One audit row for sensitive actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub action_type: String,
    pub action_data: Value,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub source_agent: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>, source_agent: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source_agent: source_agent.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Snapshot row of a teammate, used in initiative prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_type: String,
    pub status: String,
    pub current_focus: Option<String>,
}

use crate::domain::Decision;

/// The relational store the daemon persists through
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve the persistent agent id for a role; `None` when the agent was
    /// never registered (fatal at startup)
    async fn agent_id_for_type(&self, agent_type: &str) -> Result<Option<String>, StoreError>;

    /// Write the fleet-registry status of an agent
    async fn set_agent_status(&self, agent_id: &str, status: &str) -> Result<(), StoreError>;

    /// Team snapshot for initiative prompts
    async fn team_status(&self) -> Result<Vec<AgentSummary>, StoreError>;

    // === agent_state (partitioned by agent_id) ===

    async fn get_state(&self, agent_id: &str, key: &str) -> Result<Option<String>, StoreError>;
    async fn get_state_many(
        &self,
        agent_id: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, String>, StoreError>;
    async fn set_state(&self, agent_id: &str, key: &str, value: &str) -> Result<(), StoreError>;

    // === history ===

    /// Append a history row; returns the new history length for the agent
    async fn append_history(&self, record: HistoryRecord) -> Result<usize, StoreError>;

    /// Drop all but the most recent `keep` history rows for an agent
    async fn trim_history(&self, agent_id: &str, keep: usize) -> Result<(), StoreError>;

    // === events / decisions / settings / audit ===

    async fn record_event(&self, event: EventRecord) -> Result<(), StoreError>;
    async fn create_decision(&self, decision: Decision) -> Result<(), StoreError>;
    async fn pending_decisions(&self) -> Result<Vec<Decision>, StoreError>;
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn record_audit(&self, record: AuditRecord) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    agents: HashMap<String, String>,
    statuses: HashMap<String, String>,
    state: HashMap<String, HashMap<String, String>>,
    history: HashMap<String, Vec<HistoryRecord>>,
    events: Vec<EventRecord>,
    decisions: Vec<Decision>,
    settings: HashMap<String, String>,
    audits: Vec<AuditRecord>,
}

/// In-memory [`Store`] for tests and single-node development
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent so `agent_id_for_type` resolves
    pub async fn register_agent(&self, agent_type: &str, agent_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.agents.insert(agent_type.to_string(), agent_id.to_string());
    }

    pub async fn set_setting(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().await;
        inner.settings.insert(key.to_string(), value.to_string());
    }

    pub async fn add_decision(&self, decision: Decision) {
        let mut inner = self.inner.lock().await;
        inner.decisions.push(decision);
    }

    /// Test helper: all recorded events of one type
    pub async fn events_of_type(&self, event_type: &str) -> Vec<EventRecord> {
        let inner = self.inner.lock().await;
        inner
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Test helper: all audit rows
    pub async fn audits(&self) -> Vec<AuditRecord> {
        let inner = self.inner.lock().await;
        inner.audits.clone()
    }

    /// Test helper: fleet-registry status of an agent
    pub async fn status_of(&self, agent_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.statuses.get(agent_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn agent_id_for_type(&self, agent_type: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.agents.get(agent_type).cloned())
    }

    async fn set_agent_status(&self, agent_id: &str, status: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.statuses.insert(agent_id.to_string(), status.to_string());
        Ok(())
    }

    async fn team_status(&self) -> Result<Vec<AgentSummary>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .agents
            .iter()
            .map(|(agent_type, agent_id)| AgentSummary {
                agent_type: agent_type.clone(),
                status: inner.statuses.get(agent_id).cloned().unwrap_or_else(|| "unknown".into()),
                current_focus: inner
                    .state
                    .get(agent_id)
                    .and_then(|s| s.get("current_focus").cloned()),
            })
            .collect())
    }

    async fn get_state(&self, agent_id: &str, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.state.get(agent_id).and_then(|s| s.get(key).cloned()))
    }

    async fn get_state_many(
        &self,
        agent_id: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out = HashMap::new();
        if let Some(state) = inner.state.get(agent_id) {
            for key in keys {
                if let Some(value) = state.get(*key) {
                    out.insert((*key).to_string(), value.clone());
                }
            }
        }
        Ok(out)
    }

    async fn set_state(&self, agent_id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .state
            .entry(agent_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn append_history(&self, record: HistoryRecord) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let rows = inner.history.entry(record.agent_id.clone()).or_default();
        rows.push(record);
        Ok(rows.len())
    }

    async fn trim_history(&self, agent_id: &str, keep: usize) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(rows) = inner.history.get_mut(agent_id) {
            let excess = rows.len().saturating_sub(keep);
            rows.drain(..excess);
        }
        Ok(())
    }

    async fn record_event(&self, event: EventRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.events.push(event);
        Ok(())
    }

    async fn create_decision(&self, decision: Decision) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.decisions.push(decision);
        Ok(())
    }

    async fn pending_decisions(&self) -> Result<Vec<Decision>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.decisions.clone())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.settings.get(key).cloned())
    }

    async fn record_audit(&self, record: AuditRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.audits.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_resolution() {
        let store = MemoryStore::new();
        assert!(store.agent_id_for_type("ceo").await.unwrap().is_none());
        store.register_agent("ceo", "id-1").await;
        assert_eq!(store.agent_id_for_type("ceo").await.unwrap(), Some("id-1".into()));
    }

    #[tokio::test]
    async fn test_state_is_partitioned_by_agent() {
        let store = MemoryStore::new();
        store.set_state("a", "k", "1").await.unwrap();
        store.set_state("b", "k", "2").await.unwrap();
        assert_eq!(store.get_state("a", "k").await.unwrap(), Some("1".into()));
        assert_eq!(store.get_state("b", "k").await.unwrap(), Some("2".into()));
    }

    #[tokio::test]
    async fn test_get_state_many_skips_missing_keys() {
        let store = MemoryStore::new();
        store.set_state("a", "x", "1").await.unwrap();
        let got = store.get_state_many("a", &["x", "y"]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got.get("x"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn test_history_length_and_trim() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let len = store
                .append_history(HistoryRecord {
                    agent_id: "a".into(),
                    action_type: "loop".into(),
                    summary: format!("loop {}", i),
                    details: Value::Null,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
            assert_eq!(len, i + 1);
        }
        store.trim_history("a", 2).await.unwrap();
        let len = store
            .append_history(HistoryRecord {
                agent_id: "a".into(),
                action_type: "loop".into(),
                summary: "after trim".into(),
                details: Value::Null,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(len, 3);
    }
}
