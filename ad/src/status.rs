//! Fleet-registry status and the coarse status sink

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Registry status written for an agent. A pure function of the daemon
/// running flag and the last recorded error: supervisors restart anything
/// marked `active` that is not answering, so `stop()` deliberately leaves
/// the registry untouched.
pub fn fleet_status(daemon_running: bool, last_error: Option<&str>) -> &'static str {
    match (daemon_running, last_error) {
        (false, _) => "inactive",
        (true, Some(error)) if !error.is_empty() => "degraded",
        (true, _) => "active",
    }
}

/// Coarse per-loop status published to the status sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseStatus {
    Working,
    Idle,
    Blocked,
    Completed,
}

impl CoarseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Idle => "idle",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
        }
    }
}

/// Fire-and-forget reporter to the optional status-sink endpoint
pub struct StatusSink {
    client: reqwest::Client,
    url: Option<String>,
    agent_type: String,
}

impl StatusSink {
    pub fn new(url: Option<String>, agent_type: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            agent_type: agent_type.into(),
        }
    }

    /// Publish a coarse status; sink failures are logged and swallowed
    pub async fn publish(&self, status: CoarseStatus) {
        let Some(url) = &self.url else {
            return;
        };
        let body = serde_json::json!({
            "agent": self.agent_type,
            "status": status.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let result = self
            .client
            .post(url)
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await;
        if let Err(e) = result {
            debug!(error = %e, "Status sink unreachable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_status_is_pure() {
        assert_eq!(fleet_status(true, None), "active");
        assert_eq!(fleet_status(true, Some("")), "active");
        assert_eq!(fleet_status(true, Some("llm down")), "degraded");
        assert_eq!(fleet_status(false, None), "inactive");
        assert_eq!(fleet_status(false, Some("llm down")), "inactive");
    }

    #[test]
    fn test_coarse_status_labels() {
        assert_eq!(CoarseStatus::Working.as_str(), "working");
        assert_eq!(CoarseStatus::Blocked.as_str(), "blocked");
    }

    #[tokio::test]
    async fn test_publish_without_url_is_a_noop() {
        let sink = StatusSink::new(None, "cto");
        // Must not panic or block
        sink.publish(CoarseStatus::Idle).await;
    }
}
