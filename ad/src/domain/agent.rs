//! Agent roles and tiers

use serde::{Deserialize, Serialize};

/// Organisational role an agent daemon embodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    #[default]
    Ceo,
    Cto,
    Cmo,
    Coo,
    Cfo,
    Dao,
}

impl AgentType {
    /// Parse from the `AGENT_TYPE` environment value
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ceo" => Some(Self::Ceo),
            "cto" => Some(Self::Cto),
            "cmo" => Some(Self::Cmo),
            "coo" => Some(Self::Coo),
            "cfo" => Some(Self::Cfo),
            "dao" => Some(Self::Dao),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ceo => "ceo",
            Self::Cto => "cto",
            Self::Cmo => "cmo",
            Self::Coo => "coo",
            Self::Cfo => "cfo",
            Self::Dao => "dao",
        }
    }

    /// Coarse role class. Head-tier agents vote on decisions; c-level
    /// agents propose and execute.
    pub fn tier(&self) -> Tier {
        match self {
            Self::Ceo | Self::Dao => Tier::Head,
            _ => Tier::CLevel,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse role class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Head,
    CLevel,
}

impl Tier {
    /// Pub/sub channel name of this tier
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::CLevel => "clevel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roles() {
        assert_eq!(AgentType::parse("CEO"), Some(AgentType::Ceo));
        assert_eq!(AgentType::parse("cto"), Some(AgentType::Cto));
        assert_eq!(AgentType::parse("intern"), None);
    }

    #[test]
    fn test_tier_assignment() {
        assert_eq!(AgentType::Ceo.tier(), Tier::Head);
        assert_eq!(AgentType::Dao.tier(), Tier::Head);
        assert_eq!(AgentType::Cto.tier(), Tier::CLevel);
        assert_eq!(AgentType::Cmo.tier(), Tier::CLevel);
    }

    #[test]
    fn test_tier_channels() {
        assert_eq!(Tier::Head.channel(), "head");
        assert_eq!(Tier::CLevel.channel(), "clevel");
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&AgentType::Cmo).unwrap();
        assert_eq!(json, "\"cmo\"");
        let back: AgentType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AgentType::Cmo);
    }
}
