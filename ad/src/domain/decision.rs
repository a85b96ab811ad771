//! Decisions proposed for head-tier voting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Priority;

/// Weight class of a decision; message priority derives from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTier {
    #[default]
    Operational,
    Minor,
    Major,
    Critical,
}

impl DecisionTier {
    /// Message priority implied by the decision tier
    pub fn priority(&self) -> Priority {
        match self {
            Self::Operational => Priority::Low,
            Self::Minor => Priority::Normal,
            Self::Major => Priority::High,
            Self::Critical => Priority::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

/// A proposal awaiting votes from head-tier agents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tier: DecisionTier,
    pub proposed_by: String,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(title: impl Into<String>, description: impl Into<String>, tier: DecisionTier, proposed_by: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            tier,
            proposed_by: proposed_by.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_to_priority() {
        assert_eq!(DecisionTier::Operational.priority(), Priority::Low);
        assert_eq!(DecisionTier::Minor.priority(), Priority::Normal);
        assert_eq!(DecisionTier::Major.priority(), Priority::High);
        assert_eq!(DecisionTier::Critical.priority(), Priority::Urgent);
    }

    #[test]
    fn test_decision_serde() {
        let d = Decision::new("Adopt", "adopt the thing", DecisionTier::Major, "cto");
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"proposedBy\":\"cto\""));
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tier, DecisionTier::Major);
    }
}
