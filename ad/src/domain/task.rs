//! Work items addressed to one agent type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Priority;

/// A queued work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: Priority::Normal,
            from: String::new(),
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Contract a state-machine task declares on its message payload: the loop's
/// output must contain a `STATE_OUTPUT` block with every required field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTaskSpec {
    pub id: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl StateTaskSpec {
    /// Extract the spec from a `state_task` message payload
    pub fn from_payload(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_payload_decodes() {
        let t: Task = serde_json::from_str(r#"{"title":"A"}"#).unwrap();
        assert_eq!(t.title, "A");
        assert_eq!(t.priority, Priority::Normal);
        assert!(t.deadline.is_none());
    }

    #[test]
    fn test_state_task_spec_from_payload() {
        let payload = serde_json::json!({
            "id": "sm-1",
            "requiredFields": ["verdict", "confidence"]
        });
        let spec = StateTaskSpec::from_payload(&payload).unwrap();
        assert_eq!(spec.id, "sm-1");
        assert_eq!(spec.required_fields, vec!["verdict", "confidence"]);
    }

    #[test]
    fn test_encode_round_trip() {
        let t = Task::new("A", "do a").with_priority(Priority::High).with_from("ceo");
        let back: Task = serde_json::from_str(&t.encode()).unwrap();
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.from, "ceo");
    }
}
