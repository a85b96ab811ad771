//! The initiative engine proper
//!
//! Entered after an idle loop: pick the best-scoring bootstrap initiative
//! that is not a duplicate; with none left, run one AI generation call and
//! process only its `propose_initiative` actions. Every execution either
//! records an issue id or an `initiative_blocked` event - never silence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use msgfabric::{Broker, TaskQueue, channels};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{Action, Initiative, Message, MessageType, Task, Trigger};
use crate::llm::{CompletionRequest, TaskContext, parser};
use crate::profile::Profile;
use crate::runtime::Runtime;
use crate::state::StateManager;
use crate::store::{EventRecord, Store as _, StoreError};
use crate::tracker::IssueTracker as _;

use super::{is_duplicate, score};

/// Persisted cooldown key; survives restarts because it lives in agent state
const COOLDOWN_KEY: &str = "initiative_cooldown_until";

/// Timeout for the AI generation call
const AI_GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// What an initiative run concluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiativeOutcome {
    /// An external issue was opened
    Created { issue: u64 },
    /// The proposal was refused; an `initiative_blocked` event says why
    Blocked { reason: String },
    /// The gates (trigger, cooldown) kept the engine from running
    Skipped,
}

/// Proactive work generation for one agent
pub struct InitiativeEngine {
    runtime: Arc<Runtime>,
    state: StateManager,
    profile: Arc<Profile>,
    agent_type: String,
    /// Local hashes of titles this process already created
    created: Mutex<HashSet<String>>,
}

impl InitiativeEngine {
    pub fn new(runtime: Arc<Runtime>, state: StateManager, profile: Arc<Profile>, agent_type: impl Into<String>) -> Self {
        Self {
            runtime,
            state,
            profile,
            agent_type: agent_type.into(),
            created: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the persisted per-agent cooldown has expired
    pub async fn cooldown_expired(&self) -> bool {
        match self.state.get(COOLDOWN_KEY).await {
            Ok(Some(until)) => match chrono::DateTime::parse_from_rfc3339(&until) {
                Ok(until) => Utc::now() >= until,
                Err(_) => true,
            },
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Cooldown read failed, assuming expired");
                true
            }
        }
    }

    async fn set_cooldown(&self) -> Result<(), StoreError> {
        let secs = self.runtime.settings.read().await.initiative_cooldown_secs;
        let until = Utc::now() + chrono::Duration::seconds(secs as i64);
        self.state.set(COOLDOWN_KEY, &until.to_rfc3339()).await
    }

    /// The idle phase entry point. The caller has already established that
    /// the task queue is empty.
    pub async fn run(&self, trigger: Trigger) -> Result<InitiativeOutcome, StoreError> {
        if !trigger.allows_initiative() {
            debug!(%trigger, "Initiative phase not allowed for this trigger");
            return Ok(InitiativeOutcome::Skipped);
        }
        if !self.cooldown_expired().await {
            debug!("Initiative cooldown active");
            return Ok(InitiativeOutcome::Skipped);
        }

        // Best-scoring bootstrap initiative that is not already created
        if let Some(candidate) = self.best_bootstrap().await? {
            return self.propose(candidate).await;
        }

        debug!("No bootstrap candidates left, running AI generation");
        self.generate_with_ai().await
    }

    /// Highest-scoring non-duplicate bootstrap initiative
    async fn best_bootstrap(&self) -> Result<Option<Initiative>, StoreError> {
        let existing = self.runtime.tracker.all_titles().await?;
        let created = self.created.lock().await;

        let mut candidates: Vec<&Initiative> = self
            .profile
            .bootstrap_initiatives
            .iter()
            .filter(|i| !created.contains(&super::normalize_title(&i.title)))
            .filter(|i| !is_duplicate(&i.title, &existing))
            .collect();
        candidates.sort_by(|a, b| {
            score(b, &self.profile.focus)
                .partial_cmp(&score(a, &self.profile.focus))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates.first().map(|i| {
            let mut initiative = (*i).clone();
            initiative.source = "bootstrap".to_string();
            initiative
        }))
    }

    /// Create one initiative end to end: duplicate guard, ready-issue guard,
    /// tracker issue, cooldown, assignee task. Also the execution path for
    /// `propose_initiative` actions coming from the dispatcher.
    pub async fn propose(&self, initiative: Initiative) -> Result<InitiativeOutcome, StoreError> {
        // Ready work waits before new work is invented
        let snapshot = self.runtime.tracker.snapshot(&self.agent_type).await?;
        if !snapshot.ready.is_empty() {
            return self
                .blocked(&initiative, format!("{} ready issues await claiming", snapshot.ready.len()))
                .await;
        }

        let existing = self.runtime.tracker.all_titles().await?;
        let normalized = super::normalize_title(&initiative.title);
        {
            let created = self.created.lock().await;
            if created.contains(&normalized) || is_duplicate(&initiative.title, &existing) {
                drop(created);
                return self.blocked(&initiative, "duplicate title".to_string()).await;
            }
        }

        self.runtime.write_limiter.acquire().await;
        let labels = vec![
            "initiative".to_string(),
            format!("agent:{}", initiative.suggested_assignee),
            format!("priority:{}", initiative.priority),
        ];
        let issue = self
            .runtime
            .tracker
            .create_issue(&initiative.title, &initiative.description, &labels, None)
            .await?;

        self.set_cooldown().await?;
        self.created.lock().await.insert(normalized);

        // Route the work to whoever should pick it up
        let task = Task::new(&initiative.title, &initiative.description)
            .with_priority(initiative.priority)
            .with_from(&self.agent_type);
        let assignee = if initiative.suggested_assignee.is_empty() {
            self.agent_type.clone()
        } else {
            initiative.suggested_assignee.clone()
        };
        TaskQueue::enqueue_for(&self.runtime.broker, &assignee, task.encode())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let wakeup = Message::new(
            MessageType::TaskQueued,
            &self.agent_type,
            &assignee,
            json!({ "to": assignee, "issue": issue }),
        );
        let _ = self.runtime.broker.publish(channels::ORCHESTRATOR, wakeup.encode()).await;

        self.runtime
            .store
            .record_event(EventRecord::new(
                "initiative_created",
                &self.agent_type,
                json!({ "issue": issue, "title": initiative.title, "assignee": assignee, "source": initiative.source }),
            ))
            .await?;
        info!(issue, title = %initiative.title, "Initiative created");
        Ok(InitiativeOutcome::Created { issue })
    }

    async fn blocked(&self, initiative: &Initiative, reason: String) -> Result<InitiativeOutcome, StoreError> {
        warn!(title = %initiative.title, reason = %reason, "initiative_blocked");
        self.runtime
            .store
            .record_event(EventRecord::new(
                "initiative_blocked",
                &self.agent_type,
                json!({ "title": initiative.title, "reason": reason }),
            ))
            .await?;
        Ok(InitiativeOutcome::Blocked { reason })
    }

    /// AI-driven generation: one LLM call over live market data, team status
    /// and existing titles; only `propose_initiative` actions are honoured.
    async fn generate_with_ai(&self) -> Result<InitiativeOutcome, StoreError> {
        let market = self
            .state
            .get("market_price")
            .await?
            .map(|p| format!("market price: {}", p))
            .unwrap_or_else(|| "market price: unknown".to_string());
        let team = self.runtime.store.team_status().await?;
        let team_lines: Vec<String> = team
            .iter()
            .map(|a| {
                format!(
                    "- {} ({}) focus: {}",
                    a.agent_type,
                    a.status,
                    a.current_focus.as_deref().unwrap_or("none")
                )
            })
            .collect();
        let existing = self.runtime.tracker.all_titles().await?;

        let prompt = format!(
            "You are {} planning proactive work.\n\n{}\n\nTeam:\n{}\n\nExisting initiatives (do not repeat):\n{}\n\n\
             Propose at most one new initiative as JSON: {{\"actions\": [{{\"type\": \"propose_initiative\", \
             \"data\": {{\"title\", \"description\", \"revenueImpact\", \"effort\", \"tags\", \"suggestedAssignee\"}}}}]}}",
            self.profile.codename,
            market,
            team_lines.join("\n"),
            existing.join("\n"),
        );

        let request = CompletionRequest::new(&self.profile.system_prompt, prompt)
            .with_timeout(AI_GENERATION_TIMEOUT);
        let response = match self.runtime.router.complete(&TaskContext::default(), request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "AI initiative generation failed");
                return Ok(InitiativeOutcome::Skipped);
            }
        };

        let output = match parser::parse_loop_output(&response.text) {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "AI initiative output unparseable");
                return Ok(InitiativeOutcome::Skipped);
            }
        };

        for action in output.actions {
            if let Action::ProposeInitiative(mut initiative) = action {
                initiative.source = "ai".to_string();
                return self.propose(initiative).await;
            }
        }
        debug!("AI generation declared no propose_initiative action");
        Ok(InitiativeOutcome::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmRouter;
    use crate::llm::client::mock::MockLlmClient;
    use crate::rag::MemoryRag;
    use crate::store::MemoryStore;
    use crate::tracker::MemoryTracker;
    use msgfabric::MemoryBroker;

    struct Fixture {
        store: Arc<MemoryStore>,
        tracker: Arc<MemoryTracker>,
        broker: Arc<MemoryBroker>,
        engine: InitiativeEngine,
    }

    fn profile_with(bootstrap: Vec<Initiative>) -> Profile {
        Profile {
            codename: "atlas".into(),
            system_prompt: "You are the CTO.".into(),
            startup_prompt: None,
            focus: Default::default(),
            allowed_tools: vec![],
            bootstrap_initiatives: bootstrap,
        }
    }

    fn initiative(title: &str, revenue: u8, effort: u8) -> Initiative {
        serde_json::from_value(json!({
            "title": title,
            "description": "d",
            "revenueImpact": revenue,
            "effort": effort,
            "suggestedAssignee": "cmo",
        }))
        .unwrap()
    }

    fn fixture_with_llm(bootstrap: Vec<Initiative>, llm_response: &str) -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(MemoryTracker::new());
        let router = Arc::new(LlmRouter::new(Arc::new(MockLlmClient::always(llm_response))));
        let runtime = Arc::new(Runtime::new(
            broker.clone(),
            store.clone(),
            Arc::new(MemoryRag::new()),
            tracker.clone(),
            router,
        ));
        let state = StateManager::new(store.clone(), "agent-1", "cto");
        let engine = InitiativeEngine::new(runtime, state, Arc::new(profile_with(bootstrap)), "cto");
        Fixture {
            store,
            tracker,
            broker,
            engine,
        }
    }

    fn fixture(bootstrap: Vec<Initiative>) -> Fixture {
        fixture_with_llm(bootstrap, "no structured output")
    }

    #[tokio::test]
    async fn test_bootstrap_initiative_creates_issue_and_task() {
        let f = fixture(vec![initiative("Ship the docs portal", 8, 2)]);

        let outcome = f.engine.run(Trigger::Scheduled).await.unwrap();
        let InitiativeOutcome::Created { issue } = outcome else {
            panic!("Expected Created, got {:?}", outcome);
        };

        // Issue recorded, cooldown set, task enqueued to the assignee
        assert_eq!(f.tracker.all_titles().await.unwrap(), vec!["Ship the docs portal"]);
        assert!(!f.engine.cooldown_expired().await);
        assert_eq!(f.broker.list_len("queue:tasks:cmo").await.unwrap(), 1);
        let events = f.store.events_of_type("initiative_created").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["issue"], issue);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_run() {
        let f = fixture(vec![
            initiative("First idea", 8, 2),
            initiative("Second idea entirely different", 7, 2),
        ]);

        assert!(matches!(
            f.engine.run(Trigger::Scheduled).await.unwrap(),
            InitiativeOutcome::Created { .. }
        ));
        assert_eq!(f.engine.run(Trigger::Scheduled).await.unwrap(), InitiativeOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_highest_scoring_candidate_wins() {
        let f = fixture(vec![
            initiative("Low value slog", 1, 9),
            initiative("High value quick win", 9, 1),
        ]);

        f.engine.run(Trigger::Scheduled).await.unwrap();
        assert_eq!(f.tracker.all_titles().await.unwrap(), vec!["High value quick win"]);
    }

    #[tokio::test]
    async fn test_duplicate_title_is_blocked_with_event() {
        let f = fixture(vec![]);
        f.tracker.seed_issue("Ship the docs portal", "done", "cto").await;

        let outcome = f.engine.propose(initiative("Ship the docs portal!", 5, 2)).await.unwrap();
        assert!(matches!(outcome, InitiativeOutcome::Blocked { .. }));
        assert_eq!(f.store.events_of_type("initiative_blocked").await.len(), 1);
        // No second issue
        assert_eq!(f.tracker.all_titles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ready_issues_block_new_initiatives() {
        let f = fixture(vec![]);
        f.tracker.seed_issue("Already ready work", "ready", "cto").await;

        let outcome = f.engine.propose(initiative("Brand new idea", 5, 2)).await.unwrap();
        let InitiativeOutcome::Blocked { reason } = outcome else {
            panic!("Expected Blocked");
        };
        assert!(reason.contains("ready"));
        assert_eq!(f.store.events_of_type("initiative_blocked").await.len(), 1);
    }

    #[tokio::test]
    async fn test_non_initiative_trigger_skips() {
        let f = fixture(vec![initiative("Idea", 5, 2)]);
        assert_eq!(f.engine.run(Trigger::Startup).await.unwrap(), InitiativeOutcome::Skipped);
        assert!(f.tracker.all_titles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ai_generation_processes_only_propose_initiative() {
        let response = r#"{
            "actions": [
                {"type": "create_task", "data": {"to": "cmo", "title": "ignored", "description": "", "priority": "low"}},
                {"type": "propose_initiative", "data": {"title": "AI minted idea", "description": "from the model", "revenueImpact": 6, "effort": 3, "suggestedAssignee": "cto"}}
            ]
        }"#;
        let f = fixture_with_llm(vec![], response);

        let outcome = f.engine.run(Trigger::Scheduled).await.unwrap();
        assert!(matches!(outcome, InitiativeOutcome::Created { .. }));
        assert_eq!(f.tracker.all_titles().await.unwrap(), vec!["AI minted idea"]);
        let events = f.store.events_of_type("initiative_created").await;
        assert_eq!(events[0].payload["source"], "ai");
        // The create_task action must not have produced a queue entry
        assert_eq!(f.broker.list_len("queue:tasks:cmo").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ai_generation_failure_is_not_silent_success() {
        let f = fixture(vec![]);
        let outcome = f.engine.run(Trigger::Scheduled).await.unwrap();
        assert_eq!(outcome, InitiativeOutcome::Skipped);
        assert!(f.tracker.all_titles().await.unwrap().is_empty());
    }
}
