//! Actions declared by the LLM
//!
//! Every parsed action has the wire shape `{ "type": "...", "data": {...} }`.
//! Decoding is permissive: a tag this build does not know about becomes
//! [`Action::Unknown`], which the dispatcher logs at debug and drops.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use super::{DecisionTier, Initiative, Priority, WorkerTask};

/// Alert severity; `critical` escalates the alert message to urgent priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// A vote on a pending decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Veto,
    Abstain,
}

/// One side effect the LLM asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Route a task to another agent type or tier via the orchestrator
    CreateTask {
        to: String,
        title: String,
        description: String,
        priority: Priority,
    },
    /// Emit a decision proposal; priority derives from the tier
    ProposeDecision {
        title: String,
        description: String,
        tier: DecisionTier,
    },
    /// Shorthand for a tier=operational decision, low priority, no response
    Operational { title: String, description: String },
    /// Vote on a decision; audit-logged
    Vote { decision_id: String, vote: VoteChoice },
    /// Emit an alert
    Alert { message: String, severity: Severity },
    /// Start a bounded subprocess worker; audit-logged. A named `agent`
    /// routes to a named-agent executor instead of the generic worker.
    SpawnWorker {
        task: WorkerTask,
        agent: Option<String>,
    },
    /// Commit workspace changes on a branch and open a PR
    CreatePr {
        title: String,
        category: String,
        description: String,
    },
    /// Commit workspace changes directly to the default branch
    CommitToMain { message: String },
    /// Relay a PR merge intent to the orchestrator; audit-logged
    MergePr { pr: u64 },
    /// Claim review of a PR
    ClaimPr { pr: u64 },
    /// Close a PR without merging
    ClosePr { pr: u64, reason: String },
    /// Open an external issue assigned to a human
    RequestHumanAction {
        title: String,
        description: String,
        urgency: Priority,
    },
    /// Move an external issue's status label, optionally with a comment
    UpdateIssue {
        number: u64,
        status: String,
        comment: Option<String>,
    },
    /// Take ownership of a ready issue
    ClaimIssue { number: u64 },
    /// Mark an issue done
    CompleteIssue { number: u64, comment: Option<String> },
    /// Propose a new initiative (blocked while ready issues await claiming)
    ProposeInitiative(Initiative),
    /// Persist a calendar event
    ScheduleEvent {
        title: String,
        at: String,
        details: String,
    },
    /// Persist a project
    CreateProject { name: String, description: String },
    /// Persist a project task
    CreateProjectTask {
        project: String,
        title: String,
        description: String,
    },
    /// Update a project task's status
    UpdateProjectTask {
        project: String,
        task_id: String,
        status: String,
    },
    /// Spawn a named subagent
    SpawnSubagent { name: String, task: String },
    /// Unrecognised action type, logged and ignored
    Unknown { kind: String, data: Value },
}

impl Action {
    /// Wire tag of this action
    pub fn kind(&self) -> &str {
        match self {
            Self::CreateTask { .. } => "create_task",
            Self::ProposeDecision { .. } => "propose_decision",
            Self::Operational { .. } => "operational",
            Self::Vote { .. } => "vote",
            Self::Alert { .. } => "alert",
            Self::SpawnWorker { .. } => "spawn_worker",
            Self::CreatePr { .. } => "create_pr",
            Self::CommitToMain { .. } => "commit_to_main",
            Self::MergePr { .. } => "merge_pr",
            Self::ClaimPr { .. } => "claim_pr",
            Self::ClosePr { .. } => "close_pr",
            Self::RequestHumanAction { .. } => "request_human_action",
            Self::UpdateIssue { .. } => "update_issue",
            Self::ClaimIssue { .. } => "claim_issue",
            Self::CompleteIssue { .. } => "complete_issue",
            Self::ProposeInitiative(_) => "propose_initiative",
            Self::ScheduleEvent { .. } => "schedule_event",
            Self::CreateProject { .. } => "create_project",
            Self::CreateProjectTask { .. } => "create_project_task",
            Self::UpdateProjectTask { .. } => "update_project_task",
            Self::SpawnSubagent { .. } => "spawn_subagent",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Whether this action writes an audit record even on failure
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Vote { .. } | Self::SpawnWorker { .. } | Self::MergePr { .. })
    }

    fn data(&self) -> Value {
        match self {
            Self::CreateTask { to, title, description, priority } => json!({
                "to": to, "title": title, "description": description, "priority": priority,
            }),
            Self::ProposeDecision { title, description, tier } => json!({
                "title": title, "description": description, "tier": tier,
            }),
            Self::Operational { title, description } => json!({
                "title": title, "description": description,
            }),
            Self::Vote { decision_id, vote } => json!({
                "decisionId": decision_id, "vote": vote,
            }),
            Self::Alert { message, severity } => json!({
                "message": message, "severity": severity,
            }),
            Self::SpawnWorker { task, agent } => json!({
                "task": task, "agent": agent,
            }),
            Self::CreatePr { title, category, description } => json!({
                "title": title, "category": category, "description": description,
            }),
            Self::CommitToMain { message } => json!({ "message": message }),
            Self::MergePr { pr } => json!({ "pr": pr }),
            Self::ClaimPr { pr } => json!({ "pr": pr }),
            Self::ClosePr { pr, reason } => json!({ "pr": pr, "reason": reason }),
            Self::RequestHumanAction { title, description, urgency } => json!({
                "title": title, "description": description, "urgency": urgency,
            }),
            Self::UpdateIssue { number, status, comment } => json!({
                "number": number, "status": status, "comment": comment,
            }),
            Self::ClaimIssue { number } => json!({ "number": number }),
            Self::CompleteIssue { number, comment } => json!({ "number": number, "comment": comment }),
            Self::ProposeInitiative(i) => serde_json::to_value(i).unwrap_or(Value::Null),
            Self::ScheduleEvent { title, at, details } => json!({
                "title": title, "at": at, "details": details,
            }),
            Self::CreateProject { name, description } => json!({
                "name": name, "description": description,
            }),
            Self::CreateProjectTask { project, title, description } => json!({
                "project": project, "title": title, "description": description,
            }),
            Self::UpdateProjectTask { project, task_id, status } => json!({
                "project": project, "taskId": task_id, "status": status,
            }),
            Self::SpawnSubagent { name, task } => json!({ "name": name, "task": task }),
            Self::Unknown { data, .. } => data.clone(),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        json!({ "type": self.kind(), "data": self.data() }).serialize(serializer)
    }
}

// Helpers for the hand-rolled decoder below

fn str_of(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn opt_str_of(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn u64_of(data: &Value, key: &str) -> Option<u64> {
    data.get(key).and_then(Value::as_u64)
}

fn priority_of(data: &Value, key: &str) -> Priority {
    data.get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("action without a type field"))?
            .to_string();
        let data = raw.get("data").cloned().unwrap_or(Value::Null);

        let action = match kind.as_str() {
            "create_task" => Action::CreateTask {
                to: str_of(&data, "to"),
                title: str_of(&data, "title"),
                description: str_of(&data, "description"),
                priority: priority_of(&data, "priority"),
            },
            "propose_decision" => Action::ProposeDecision {
                title: str_of(&data, "title"),
                description: str_of(&data, "description"),
                tier: data
                    .get("tier")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
            },
            "operational" => Action::Operational {
                title: str_of(&data, "title"),
                description: str_of(&data, "description"),
            },
            "vote" => Action::Vote {
                decision_id: opt_str_of(&data, "decisionId")
                    .or_else(|| opt_str_of(&data, "decision_id"))
                    .unwrap_or_default(),
                vote: data
                    .get("vote")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(VoteChoice::Abstain),
            },
            "alert" => Action::Alert {
                message: str_of(&data, "message"),
                severity: data
                    .get("severity")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default(),
            },
            "spawn_worker" => Action::SpawnWorker {
                task: serde_json::from_value(data.get("task").cloned().unwrap_or(Value::Null))
                    .map_err(|e| D::Error::custom(format!("spawn_worker task: {}", e)))?,
                agent: opt_str_of(&data, "agent"),
            },
            "create_pr" => Action::CreatePr {
                title: str_of(&data, "title"),
                category: str_of(&data, "category"),
                description: str_of(&data, "description"),
            },
            "commit_to_main" => Action::CommitToMain {
                message: str_of(&data, "message"),
            },
            "merge_pr" => Action::MergePr {
                pr: u64_of(&data, "pr").unwrap_or(0),
            },
            "claim_pr" => Action::ClaimPr {
                pr: u64_of(&data, "pr").unwrap_or(0),
            },
            "close_pr" => Action::ClosePr {
                pr: u64_of(&data, "pr").unwrap_or(0),
                reason: str_of(&data, "reason"),
            },
            "request_human_action" => Action::RequestHumanAction {
                title: str_of(&data, "title"),
                description: str_of(&data, "description"),
                urgency: priority_of(&data, "urgency"),
            },
            "update_issue" => Action::UpdateIssue {
                number: u64_of(&data, "number").unwrap_or(0),
                status: str_of(&data, "status"),
                comment: opt_str_of(&data, "comment"),
            },
            "claim_issue" => Action::ClaimIssue {
                number: u64_of(&data, "number").unwrap_or(0),
            },
            "complete_issue" => Action::CompleteIssue {
                number: u64_of(&data, "number").unwrap_or(0),
                comment: opt_str_of(&data, "comment"),
            },
            "propose_initiative" => Action::ProposeInitiative(
                serde_json::from_value(data.clone())
                    .map_err(|e| D::Error::custom(format!("propose_initiative: {}", e)))?,
            ),
            "schedule_event" => Action::ScheduleEvent {
                title: str_of(&data, "title"),
                at: str_of(&data, "at"),
                details: str_of(&data, "details"),
            },
            "create_project" => Action::CreateProject {
                name: str_of(&data, "name"),
                description: str_of(&data, "description"),
            },
            "create_project_task" => Action::CreateProjectTask {
                project: str_of(&data, "project"),
                title: str_of(&data, "title"),
                description: str_of(&data, "description"),
            },
            "update_project_task" => Action::UpdateProjectTask {
                project: str_of(&data, "project"),
                task_id: opt_str_of(&data, "taskId")
                    .or_else(|| opt_str_of(&data, "task_id"))
                    .unwrap_or_default(),
                status: str_of(&data, "status"),
            },
            "spawn_subagent" => Action::SpawnSubagent {
                name: str_of(&data, "name"),
                task: str_of(&data, "task"),
            },
            _ => Action::Unknown { kind, data },
        };
        Ok(action)
    }
}
