//! Short-lived subprocess worker contracts

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task handed to a subprocess worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub id: String,
    /// Task kind, e.g. "research" or "image_generation"
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-text instruction for the worker
    pub task: String,
    /// Tool servers the worker may use
    #[serde(default)]
    pub tools: Vec<String>,
    /// Per-task timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WorkerTask {
    /// Shape check done before spawning: id, kind, text and tool list must
    /// all be non-empty
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("worker task id is empty".to_string());
        }
        if self.kind.trim().is_empty() {
            return Err("worker task type is empty".to_string());
        }
        if self.task.trim().is_empty() {
            return Err("worker task text is empty".to_string());
        }
        if self.tools.is_empty() {
            return Err("worker task has no tools".to_string());
        }
        Ok(())
    }
}

/// What a finished worker reports back to its parent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutcome {
    pub task_id: String,
    /// Original task text, kept so passive fact extraction can key on it
    #[serde(default)]
    pub task: String,
    pub success: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl WorkerOutcome {
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task: String::new(),
            success: false,
            result: String::new(),
            api_used: None,
            error: Some(error.into()),
            structured: None,
        }
    }
}
