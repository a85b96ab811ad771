//! Issue tracker seam
//!
//! The code-hosting issue tracker is external. The daemon reads a per-agent
//! kanban snapshot for loop context, opens issues for initiatives and human
//! requests, and moves status labels. All writes go through the process-wide
//! write limiter (see `worker::ratelimit`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::StoreError;

/// One issue reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    pub title: String,
}

/// Per-agent snapshot of the tracker board
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KanbanSnapshot {
    pub in_progress: Vec<IssueRef>,
    pub ready: Vec<IssueRef>,
    pub review: Vec<IssueRef>,
}

impl KanbanSnapshot {
    /// Render for the loop prompt
    pub fn summary(&self) -> String {
        fn titles(items: &[IssueRef]) -> String {
            if items.is_empty() {
                "-".to_string()
            } else {
                items
                    .iter()
                    .map(|i| format!("#{} {}", i.number, i.title))
                    .collect::<Vec<_>>()
                    .join("; ")
            }
        }
        format!(
            "in progress: {}\nready: {}\nin review: {}",
            titles(&self.in_progress),
            titles(&self.ready),
            titles(&self.review)
        )
    }
}

/// The external issue tracker
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Board snapshot scoped to one agent type
    async fn snapshot(&self, agent_type: &str) -> Result<KanbanSnapshot, StoreError>;

    /// Open an issue; returns its number
    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
        assignee: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Move an issue's status label
    async fn set_status(&self, number: u64, status: &str) -> Result<(), StoreError>;

    /// Comment on an issue
    async fn comment(&self, number: u64, body: &str) -> Result<(), StoreError>;

    /// All issue titles, for the duplicate guard's fuzzy search
    async fn all_titles(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct MemoryIssue {
    number: u64,
    title: String,
    status: String,
    labels: Vec<String>,
    assignee: Option<String>,
    comments: Vec<String>,
}

/// In-memory tracker for tests and single-node development
#[derive(Default)]
pub struct MemoryTracker {
    inner: Mutex<Vec<MemoryIssue>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed an issue in a given status bucket for an agent
    pub async fn seed_issue(&self, title: &str, status: &str, agent_type: &str) -> u64 {
        let mut issues = self.inner.lock().await;
        let number = issues.len() as u64 + 1;
        issues.push(MemoryIssue {
            number,
            title: title.to_string(),
            status: status.to_string(),
            labels: vec![format!("agent:{}", agent_type)],
            assignee: None,
            comments: Vec::new(),
        });
        number
    }

    /// Test helper: status of one issue
    pub async fn status_of(&self, number: u64) -> Option<String> {
        let issues = self.inner.lock().await;
        issues.iter().find(|i| i.number == number).map(|i| i.status.clone())
    }

    /// Test helper: comments of one issue
    pub async fn comments_of(&self, number: u64) -> Vec<String> {
        let issues = self.inner.lock().await;
        issues
            .iter()
            .find(|i| i.number == number)
            .map(|i| i.comments.clone())
            .unwrap_or_default()
    }

    /// Test helper: assignee of one issue
    pub async fn assignee_of(&self, number: u64) -> Option<String> {
        let issues = self.inner.lock().await;
        issues.iter().find(|i| i.number == number).and_then(|i| i.assignee.clone())
    }
}

#[async_trait]
impl IssueTracker for MemoryTracker {
    async fn snapshot(&self, agent_type: &str) -> Result<KanbanSnapshot, StoreError> {
        let label = format!("agent:{}", agent_type);
        let issues = self.inner.lock().await;
        let mut snapshot = KanbanSnapshot::default();
        for issue in issues.iter().filter(|i| i.labels.contains(&label)) {
            let r = IssueRef {
                number: issue.number,
                title: issue.title.clone(),
            };
            match issue.status.as_str() {
                "in_progress" => snapshot.in_progress.push(r),
                "ready" => snapshot.ready.push(r),
                "review" => snapshot.review.push(r),
                _ => {}
            }
        }
        Ok(snapshot)
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
        assignee: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut issues = self.inner.lock().await;
        let number = issues.len() as u64 + 1;
        issues.push(MemoryIssue {
            number,
            title: title.to_string(),
            status: "ready".to_string(),
            labels: labels.to_vec(),
            assignee: assignee.map(str::to_string),
            comments: vec![body.to_string()],
        });
        Ok(number)
    }

    async fn set_status(&self, number: u64, status: &str) -> Result<(), StoreError> {
        let mut issues = self.inner.lock().await;
        if let Some(issue) = issues.iter_mut().find(|i| i.number == number) {
            issue.status = status.to_string();
        }
        Ok(())
    }

    async fn comment(&self, number: u64, body: &str) -> Result<(), StoreError> {
        let mut issues = self.inner.lock().await;
        if let Some(issue) = issues.iter_mut().find(|i| i.number == number) {
            issue.comments.push(body.to_string());
        }
        Ok(())
    }

    async fn all_titles(&self) -> Result<Vec<String>, StoreError> {
        let issues = self.inner.lock().await;
        Ok(issues.iter().map(|i| i.title.clone()).collect())
    }
}
