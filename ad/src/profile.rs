//! Agent profile loading
//!
//! The profile document defines who the agent is: codename, prompts, focus
//! weights, worker tool allow-list, and the bootstrap initiative backlog.
//! Parsing the richer profile-markdown format is an external concern; the
//! daemon consumes the YAML rendition at `PROFILE_PATH`.

use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::Initiative;

/// Focus weights steering the initiative scoring formula
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusArea {
    pub key_questions: Vec<String>,
    pub revenue_angles: Vec<String>,
    pub scan_topics: Vec<String>,
    /// Weight on revenue impact, 0..=1
    pub revenue_focus: f64,
    /// 0 = pure dev, 1 = pure marketing
    pub marketing_vs_dev: f64,
    /// Weight on community-tagged work, 0..=1
    pub community_growth: f64,
    /// Dampening applied to risk-tagged work, 0..=1
    pub risk_tolerance: f64,
    /// 0 = short-term only, 1 = long horizon
    pub time_horizon: f64,
}

impl Default for FocusArea {
    fn default() -> Self {
        Self {
            key_questions: Vec::new(),
            revenue_angles: Vec::new(),
            scan_topics: Vec::new(),
            revenue_focus: 0.5,
            marketing_vs_dev: 0.5,
            community_growth: 0.5,
            risk_tolerance: 0.5,
            time_horizon: 0.5,
        }
    }
}

/// The agent profile document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Short stable name used in RAG queries and logs
    pub codename: String,
    /// System prompt sent on every loop
    pub system_prompt: String,
    /// Optional prompt run once as the `startup` loop
    #[serde(default)]
    pub startup_prompt: Option<String>,
    #[serde(default)]
    pub focus: FocusArea,
    /// Tool servers workers spawned by this agent may request
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Pre-authored initiatives scored when the agent is idle
    #[serde(default)]
    pub bootstrap_initiatives: Vec<Initiative>,
}

impl Profile {
    /// Load the profile from `PROFILE_PATH`; missing profiles are fatal
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile at {}", path.display()))?;
        let profile: Profile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse profile at {}", path.display()))?;
        Ok(profile)
    }
}
