//! StateManager - one agent's view of its persisted state

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::store::{EventRecord, HistoryRecord, Store, StoreError};

/// The six well-known keys a loop reads; never the full state bag
const ESSENTIAL_KEYS: [&str; 6] = [
    "loop_count",
    "last_loop_at",
    "success_count",
    "error_count",
    "current_focus",
    "last_error",
];

/// History length at which a summary is enqueued for archival
const HISTORY_ARCHIVE_THRESHOLD: usize = 50;

/// History rows kept after an archival enqueue
const HISTORY_KEEP: usize = 25;

/// Essential per-agent facts loaded at the top of every loop
#[derive(Debug, Clone, Default)]
pub struct EssentialState {
    pub loop_count: u64,
    pub last_loop_at: Option<String>,
    pub success_count: u64,
    pub error_count: u64,
    pub current_focus: Option<String>,
    pub last_error: Option<String>,
}

impl EssentialState {
    /// Render for the loop prompt
    pub fn summary(&self) -> String {
        format!(
            "loops: {} (ok {}, failed {}), last at {}, focus: {}",
            self.loop_count,
            self.success_count,
            self.error_count,
            self.last_loop_at.as_deref().unwrap_or("never"),
            self.current_focus.as_deref().unwrap_or("none"),
        )
    }
}

/// Handle bound to one agent's partition of the state store
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn Store>,
    agent_id: String,
    agent_type: String,
}

impl StateManager {
    pub fn new(store: Arc<dyn Store>, agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Read the essential keys only
    pub async fn essential(&self) -> Result<EssentialState, StoreError> {
        let map = self.store.get_state_many(&self.agent_id, &ESSENTIAL_KEYS).await?;
        let parse_u64 = |key: &str| map.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(EssentialState {
            loop_count: parse_u64("loop_count"),
            last_loop_at: map.get("last_loop_at").cloned(),
            success_count: parse_u64("success_count"),
            error_count: parse_u64("error_count"),
            current_focus: map.get("current_focus").cloned(),
            last_error: map.get("last_error").cloned(),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.get_state(&self.agent_id, key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store.set_state(&self.agent_id, key, value).await
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let current: u64 = self
            .store
            .get_state(&self.agent_id, key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        self.store.set_state(&self.agent_id, key, &next.to_string()).await?;
        Ok(next)
    }

    pub async fn increment_loop_count(&self) -> Result<u64, StoreError> {
        self.increment("loop_count").await
    }

    pub async fn record_success(&self) -> Result<(), StoreError> {
        self.increment("success_count").await?;
        self.set("last_error", "").await
    }

    pub async fn record_error(&self, error: &str) -> Result<(), StoreError> {
        self.increment("error_count").await?;
        self.set("last_error", error).await
    }

    pub async fn touch_last_loop_at(&self) -> Result<(), StoreError> {
        self.set("last_loop_at", &Utc::now().to_rfc3339()).await
    }

    /// Apply the LLM's declared state updates. Non-string values are stored
    /// as their JSON encoding.
    pub async fn apply_updates(&self, updates: &Map<String, Value>) -> Result<(), StoreError> {
        for (key, value) in updates {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            debug!(key = %key, "State update");
            self.set(key, &rendered).await?;
        }
        Ok(())
    }

    /// Append a history record; at the archival threshold, enqueue a summary
    /// event and trim the retained rows.
    pub async fn record_history(&self, action_type: &str, summary: &str, details: Value) -> Result<(), StoreError> {
        let length = self
            .store
            .append_history(HistoryRecord {
                agent_id: self.agent_id.clone(),
                action_type: action_type.to_string(),
                summary: summary.to_string(),
                details,
                created_at: Utc::now(),
            })
            .await?;

        if length >= HISTORY_ARCHIVE_THRESHOLD {
            debug!(length, "History at archival threshold");
            self.store
                .record_event(EventRecord::new(
                    "history_archival_enqueued",
                    &self.agent_type,
                    serde_json::json!({ "length": length }),
                ))
                .await?;
            self.store.trim_history(&self.agent_id, HISTORY_KEEP).await?;
        }
        Ok(())
    }

    /// Passive extraction: pull numeric facts out of a worker result and
    /// write them with a freshness timestamp, independent of any LLM run.
    pub async fn apply_worker_result(&self, task_text: &str, result_text: &str) -> Result<usize, StoreError> {
        let facts = super::extract_worker_facts(task_text, result_text);
        let count = facts.len();
        let now = Utc::now().to_rfc3339();
        for (key, value) in facts {
            debug!(key = %key, value = %value, "Extracted worker fact");
            self.set(&key, &value).await?;
            self.set(&format!("{}_updated_at", key), &now).await?;
        }
        if count > 0 {
            debug!(count, "Worker result facts stored");
        } else {
            warn!("Worker result yielded no extractable facts");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, StateManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = StateManager::new(store.clone(), "agent-1", "cto");
        (store, manager)
    }

    #[tokio::test]
    async fn test_essential_defaults_when_empty() {
        let (_store, manager) = manager();
        let state = manager.essential().await.unwrap();
        assert_eq!(state.loop_count, 0);
        assert!(state.last_loop_at.is_none());
        assert!(state.summary().contains("loops: 0"));
    }

    #[tokio::test]
    async fn test_counters_increment() {
        let (_store, manager) = manager();
        assert_eq!(manager.increment_loop_count().await.unwrap(), 1);
        assert_eq!(manager.increment_loop_count().await.unwrap(), 2);
        manager.record_success().await.unwrap();
        manager.record_error("llm down").await.unwrap();

        let state = manager.essential().await.unwrap();
        assert_eq!(state.loop_count, 2);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.error_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("llm down"));
    }

    #[tokio::test]
    async fn test_apply_updates_stringifies_values() {
        let (_store, manager) = manager();
        let mut updates = Map::new();
        updates.insert("current_focus".into(), Value::String("infra".into()));
        updates.insert("open_prs".into(), Value::from(3));
        manager.apply_updates(&updates).await.unwrap();

        assert_eq!(manager.get("current_focus").await.unwrap(), Some("infra".into()));
        assert_eq!(manager.get("open_prs").await.unwrap(), Some("3".into()));
    }

    #[tokio::test]
    async fn test_history_archival_at_threshold() {
        let (store, manager) = manager();
        for i in 0..HISTORY_ARCHIVE_THRESHOLD {
            manager
                .record_history("loop", &format!("loop {}", i), Value::Null)
                .await
                .unwrap();
        }
        let events = store.events_of_type("history_archival_enqueued").await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_result_writes_facts_with_freshness() {
        let (_store, manager) = manager();
        let count = manager
            .apply_worker_result("check the token price", "The price is $0.0042 today")
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(manager.get("market_price").await.unwrap(), Some("0.0042".into()));
        assert!(manager.get("market_price_updated_at").await.unwrap().is_some());
    }
}
