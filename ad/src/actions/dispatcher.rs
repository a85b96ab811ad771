//! The action switch
//!
//! Each parsed action fans out to its side effect through the retry wrapper.
//! Failures that exhaust their retries land in the dead-letter list; vote,
//! spawn_worker and merge_pr leave an audit record either way.

use std::sync::Arc;

use chrono::Utc;
use msgfabric::{Broker as _, channels};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{
    Action, Decision, DecisionTier, Message, MessageType, Priority, Severity, Task, Tier,
};
use crate::initiative::InitiativeEngine;
use crate::runtime::Runtime;
use crate::store::{AuditRecord, EventRecord, Store as _, StoreError};
use crate::tracker::IssueTracker as _;
use crate::worker::{WorkerError, WorkerSpawner};
use crate::workspace::{CommitMode, WorkspaceManager};

use super::retry::{push_dead_letter, with_backoff};

/// Action execution failures
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Fabric(#[from] msgfabric::FabricError),
}

impl ActionError {
    /// Permanent failures skip the remaining retry attempts
    pub fn is_permanent(&self) -> bool {
        matches!(self, ActionError::Permanent(_))
    }
}

impl From<WorkerError> for ActionError {
    fn from(e: WorkerError) -> Self {
        if e.is_permanent() {
            ActionError::Permanent(e.to_string())
        } else {
            ActionError::Failed(e.to_string())
        }
    }
}

/// Outcome accounting for one batch of actions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub succeeded: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// Executes parsed actions for one agent
pub struct ActionDispatcher {
    runtime: Arc<Runtime>,
    agent_id: String,
    agent_type: String,
    tier: Tier,
    workers: Arc<WorkerSpawner>,
    initiatives: Arc<InitiativeEngine>,
    workspace: Option<Arc<WorkspaceManager>>,
}

impl ActionDispatcher {
    pub fn new(
        runtime: Arc<Runtime>,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        tier: Tier,
        workers: Arc<WorkerSpawner>,
        initiatives: Arc<InitiativeEngine>,
        workspace: Option<Arc<WorkspaceManager>>,
    ) -> Self {
        Self {
            runtime,
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            tier,
            workers,
            initiatives,
            workspace,
        }
    }

    /// Dispatch a batch of actions in order; returns per-batch accounting.
    /// Whether any action committed the workspace is reported so the loop
    /// can skip its own file-change commit sweep.
    pub async fn dispatch_all(&self, actions: &[Action], correlation_id: Option<&str>) -> (DispatchStats, bool) {
        let mut stats = DispatchStats::default();
        let mut workspace_handled = false;

        for action in actions {
            if let Action::Unknown { kind, data } = action {
                debug!(kind = %kind, ?data, "Ignoring unknown action type");
                stats.ignored += 1;
                continue;
            }
            if matches!(action, Action::CreatePr { .. } | Action::CommitToMain { .. }) {
                workspace_handled = true;
            }

            let result = with_backoff(action.kind(), || self.execute(action, correlation_id)).await;

            if action.is_sensitive() {
                self.audit(action, &result).await;
            }

            match result {
                Ok(()) => stats.succeeded += 1,
                Err(e) => {
                    stats.failed += 1;
                    push_dead_letter(&self.runtime.broker, &self.agent_type, action, &e).await;
                }
            }
        }

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            ignored = stats.ignored,
            "Action batch dispatched"
        );
        (stats, workspace_handled)
    }

    /// Audit record with redacted payload, success or not
    async fn audit(&self, action: &Action, result: &Result<(), ActionError>) {
        let data = serde_json::to_value(action).map(redact).unwrap_or(Value::Null);
        let record = AuditRecord {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type.clone(),
            action_type: action.kind().to_string(),
            action_data: data,
            success: result.is_ok(),
            error_message: result.as_ref().err().map(|e| e.to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.runtime.store.record_audit(record).await {
            warn!(error = %e, "Failed to write audit record");
        }
    }

    async fn publish(&self, channel: &str, message: Message) -> Result<(), ActionError> {
        self.runtime.broker.publish(channel, message.encode()).await?;
        Ok(())
    }

    fn message(&self, kind: MessageType, to: &str, payload: Value, correlation_id: Option<&str>) -> Message {
        Message::new(kind, &self.agent_type, to, payload)
            .with_correlation(correlation_id.map(str::to_string))
    }

    /// One attempt at one action
    async fn execute(&self, action: &Action, correlation_id: Option<&str>) -> Result<(), ActionError> {
        match action {
            Action::CreateTask { to, title, description, priority } => {
                let task = Task::new(title, description)
                    .with_priority(*priority)
                    .with_from(&self.agent_type);
                let message = self
                    .message(
                        MessageType::Task,
                        to,
                        json!({ "to": to, "task": task }),
                        correlation_id,
                    )
                    .with_priority(*priority);
                self.publish(channels::ORCHESTRATOR, message).await
            }

            Action::ProposeDecision { title, description, tier } => {
                self.propose_decision(title, description, *tier, true, correlation_id).await
            }

            Action::Operational { title, description } => {
                self.propose_decision(title, description, DecisionTier::Operational, false, correlation_id)
                    .await
            }

            Action::Vote { decision_id, vote } => {
                if self.tier != Tier::Head {
                    // Voting is normally a head-tier right
                    debug!(agent = %self.agent_type, "Vote cast by non-head agent");
                }
                let message = self.message(
                    MessageType::Vote,
                    channels::ORCHESTRATOR,
                    json!({ "decisionId": decision_id, "vote": vote }),
                    correlation_id,
                );
                self.publish(channels::ORCHESTRATOR, message).await
            }

            Action::Alert { message, severity } => {
                let priority = if *severity == Severity::Critical {
                    Priority::Urgent
                } else {
                    Priority::High
                };
                let alert = self
                    .message(
                        MessageType::Alert,
                        channels::BROADCAST,
                        json!({ "message": message, "severity": severity }),
                        correlation_id,
                    )
                    .with_priority(priority);
                self.publish(channels::BROADCAST, alert).await
            }

            Action::SpawnWorker { task, agent } => match agent {
                Some(agent) => {
                    // Named-agent execution is routed, not spawned locally
                    let message = self.message(
                        MessageType::Task,
                        agent,
                        json!({ "agent": agent, "task": task }),
                        correlation_id,
                    );
                    self.publish(channels::ORCHESTRATOR, message).await
                }
                None => {
                    self.workers
                        .spawn(task.clone(), correlation_id.map(str::to_string))
                        .await?;
                    Ok(())
                }
            },

            Action::CreatePr { title, category, description } => {
                self.commit_workspace(
                    CommitMode::Pr {
                        category: category.clone(),
                    },
                    &format!("{}\n\n{}", title, description),
                    correlation_id,
                )
                .await
            }

            Action::CommitToMain { message } => {
                self.commit_workspace(CommitMode::Direct, message, correlation_id).await
            }

            Action::MergePr { pr } => self.relay_pr("pr_merge", *pr, None, correlation_id).await,
            Action::ClaimPr { pr } => self.relay_pr("pr_claim", *pr, None, correlation_id).await,
            Action::ClosePr { pr, reason } => {
                self.relay_pr("pr_close", *pr, Some(reason.clone()), correlation_id).await
            }

            Action::RequestHumanAction { title, description, urgency } => {
                self.runtime.write_limiter.acquire().await;
                let assignee = self
                    .runtime
                    .store
                    .get_setting("human_operator")
                    .await?
                    .unwrap_or_else(|| "operator".to_string());
                let labels = vec!["human-action".to_string(), format!("urgency:{}", urgency)];
                let issue = self
                    .runtime
                    .tracker
                    .create_issue(title, description, &labels, Some(assignee.as_str()))
                    .await?;
                info!(issue, assignee = %assignee, "Human action requested");
                Ok(())
            }

            Action::UpdateIssue { number, status, comment } => {
                self.runtime.write_limiter.acquire().await;
                self.runtime.tracker.set_status(*number, status).await?;
                if let Some(comment) = comment {
                    self.runtime.tracker.comment(*number, comment).await?;
                }
                Ok(())
            }

            Action::ClaimIssue { number } => {
                self.runtime.write_limiter.acquire().await;
                self.runtime.tracker.set_status(*number, "in_progress").await?;
                self.runtime
                    .tracker
                    .comment(*number, &format!("Claimed by {}", self.agent_type))
                    .await?;
                Ok(())
            }

            Action::CompleteIssue { number, comment } => {
                self.runtime.write_limiter.acquire().await;
                self.runtime.tracker.set_status(*number, "done").await?;
                let body = comment.clone().unwrap_or_else(|| format!("Completed by {}", self.agent_type));
                self.runtime.tracker.comment(*number, &body).await?;
                Ok(())
            }

            Action::ProposeInitiative(initiative) => {
                self.initiatives.propose(initiative.clone()).await?;
                Ok(())
            }

            Action::ScheduleEvent { title, at, details } => {
                self.persist_entity("event_scheduled", json!({ "title": title, "at": at, "details": details }), correlation_id)
                    .await
            }
            Action::CreateProject { name, description } => {
                self.persist_entity("project_created", json!({ "name": name, "description": description }), correlation_id)
                    .await
            }
            Action::CreateProjectTask { project, title, description } => {
                self.persist_entity(
                    "project_task_created",
                    json!({ "project": project, "title": title, "description": description }),
                    correlation_id,
                )
                .await
            }
            Action::UpdateProjectTask { project, task_id, status } => {
                self.persist_entity(
                    "project_task_updated",
                    json!({ "project": project, "taskId": task_id, "status": status }),
                    correlation_id,
                )
                .await
            }
            Action::SpawnSubagent { name, task } => {
                self.persist_entity("subagent_spawned", json!({ "name": name, "task": task }), correlation_id)
                    .await
            }

            Action::Unknown { .. } => Ok(()),
        }
    }

    async fn propose_decision(
        &self,
        title: &str,
        description: &str,
        tier: DecisionTier,
        requires_response: bool,
        correlation_id: Option<&str>,
    ) -> Result<(), ActionError> {
        let decision = Decision::new(title, description, tier, &self.agent_type);
        self.runtime.store.create_decision(decision.clone()).await?;

        let mut message = self
            .message(
                MessageType::Decision,
                Tier::Head.channel(),
                serde_json::to_value(&decision).unwrap_or(Value::Null),
                correlation_id,
            )
            .with_priority(tier.priority());
        message.requires_response = requires_response;
        self.publish(Tier::Head.channel(), message).await
    }

    async fn commit_workspace(
        &self,
        mode: CommitMode,
        message: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), ActionError> {
        let Some(workspace) = &self.workspace else {
            return Err(ActionError::Permanent("agent has no workspace".to_string()));
        };
        let outcome = workspace
            .commit_pipeline(mode, message)
            .await
            .map_err(|e| ActionError::Failed(e.to_string()))?;

        if let Some(outcome) = outcome {
            self.runtime
                .store
                .record_event(EventRecord::new(
                    "workspace_commit",
                    &self.agent_type,
                    json!({ "branch": outcome.branch, "files": outcome.files, "pushed": outcome.pushed }),
                ))
                .await?;
            let event = self.message(
                MessageType::Other("workspace_commit".to_string()),
                channels::ORCHESTRATOR,
                json!({ "branch": outcome.branch, "message": outcome.message }),
                correlation_id,
            );
            self.publish(channels::ORCHESTRATOR, event).await?;
        }
        Ok(())
    }

    async fn relay_pr(
        &self,
        intent: &str,
        pr: u64,
        reason: Option<String>,
        correlation_id: Option<&str>,
    ) -> Result<(), ActionError> {
        let message = self.message(
            MessageType::Other(intent.to_string()),
            channels::ORCHESTRATOR,
            json!({ "pr": pr, "reason": reason }),
            correlation_id,
        );
        self.publish(channels::ORCHESTRATOR, message).await?;
        self.runtime
            .store
            .record_event(EventRecord::new(intent, &self.agent_type, json!({ "pr": pr })))
            .await?;
        Ok(())
    }

    /// Persist a project/calendar entity as an event row and publish its
    /// lifecycle message
    async fn persist_entity(&self, event_type: &str, payload: Value, correlation_id: Option<&str>) -> Result<(), ActionError> {
        self.runtime
            .store
            .record_event(EventRecord::new(event_type, &self.agent_type, payload.clone()))
            .await?;
        let message = self.message(
            MessageType::Other(event_type.to_string()),
            channels::ORCHESTRATOR,
            payload,
            correlation_id,
        );
        self.publish(channels::ORCHESTRATOR, message).await
    }
}

/// Replace likely-secret values in an action payload before persisting it
fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, v)| {
                    let lower = key.to_lowercase();
                    let sensitive = ["token", "secret", "password", "apikey", "api_key"]
                        .iter()
                        .any(|marker| lower.contains(marker));
                    if sensitive {
                        (key, Value::String("[redacted]".to_string()))
                    } else {
                        (key, redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
