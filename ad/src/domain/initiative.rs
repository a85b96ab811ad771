//! Self-proposed work items

use serde::{Deserialize, Serialize};

use super::Priority;

/// A proactive work proposal generated while the agent is otherwise idle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiative {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Expected revenue impact, 1-10
    #[serde(default = "default_score")]
    pub revenue_impact: u8,
    /// Expected effort, 1-10
    #[serde(default = "default_score")]
    pub effort: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub suggested_assignee: String,
    /// Where the proposal came from: "bootstrap" or "ai"
    #[serde(default)]
    pub source: String,
}

fn default_score() -> u8 {
    5
}

impl Initiative {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}
