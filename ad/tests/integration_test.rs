//! Integration tests for the agent daemon
//!
//! End-to-end scenarios over the in-process collaborators: a real daemon,
//! real queues and streams, and a scripted LLM.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use agentdaemon::actions::ActionDispatcher;
use agentdaemon::config::{DaemonConfig, RuntimeSettings};
use agentdaemon::daemon::AgentDaemon;
use agentdaemon::domain::{Action, AgentType, Message, MessageType, Tier, Trigger};
use agentdaemon::initiative::InitiativeEngine;
use agentdaemon::llm::{
    CompletionRequest, CompletionResponse, LlmClient, LlmError, LlmRouter, TokenUsage,
};
use agentdaemon::looprun::{LoopRunner, PromptBuilder};
use agentdaemon::profile::Profile;
use agentdaemon::rag::MemoryRag;
use agentdaemon::runtime::Runtime;
use agentdaemon::state::StateManager;
use agentdaemon::status::StatusSink;
use agentdaemon::store::{MemoryStore, Store, StoreError};
use agentdaemon::tracker::{IssueTracker, KanbanSnapshot, MemoryTracker};
use agentdaemon::worker::{
    McpConfigCache, ToolCatalog, WorkerError, WorkerInvoker, WorkerLimits, WorkerSpawner,
};
use msgfabric::{Broker, MemoryBroker, TaskQueue, channels};

/// Scripted LLM: fixed reply, optional per-call latency, and an in-flight
/// gauge for the single-flight assertion
struct ScriptedLlm {
    reply: String,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedLlm {
    fn new(reply: &str) -> Self {
        Self::with_latency(reply, Duration::ZERO)
    }

    fn with_latency(reply: &str, latency: Duration) -> Self {
        Self {
            reply: reply.to_string(),
            latency,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            text: self.reply.clone(),
            usage: TokenUsage::default(),
        })
    }

    async fn probe(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

struct NoopInvoker;

#[async_trait]
impl WorkerInvoker for NoopInvoker {
    async fn invoke(&self, _config: &Path, _prompt: &str, _timeout: Duration) -> Result<String, WorkerError> {
        Ok("{}".to_string())
    }
}

struct Fixture {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    tracker: Arc<MemoryTracker>,
    runtime: Arc<Runtime>,
    llm: Arc<ScriptedLlm>,
    config: DaemonConfig,
    _profile_file: tempfile::NamedTempFile,
}

fn fixture(llm: ScriptedLlm, profile_yaml: &str) -> Fixture {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let tracker = Arc::new(MemoryTracker::new());
    let llm = Arc::new(llm);
    let router = Arc::new(LlmRouter::new(llm.clone() as Arc<dyn LlmClient>));
    let runtime = Arc::new(Runtime::new(
        broker.clone(),
        store.clone(),
        Arc::new(MemoryRag::new()),
        tracker.clone(),
        router,
    ));

    let mut profile_file = tempfile::NamedTempFile::new().unwrap();
    write!(profile_file, "{}", profile_yaml).unwrap();

    let config = DaemonConfig {
        agent_type: AgentType::Cto,
        profile_path: profile_file.path().to_string_lossy().to_string(),
        loop_enabled: false,
        health_port: 0,
        ..Default::default()
    };

    Fixture {
        broker,
        store,
        tracker,
        runtime,
        llm,
        config,
        _profile_file: profile_file,
    }
}

const PLAIN_PROFILE: &str = "codename: atlas\nsystem_prompt: You are the CTO.\n";

async fn start(f: &Fixture) -> Arc<AgentDaemon> {
    f.store.register_agent("cto", "agent-1").await;
    AgentDaemon::start(f.config.clone(), f.runtime.clone(), Arc::new(NoopInvoker))
        .await
        .expect("daemon should start")
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

// =============================================================================
// Scenario: scheduled tick, empty queue, cooldown expired
// =============================================================================

#[tokio::test]
async fn test_scheduled_tick_on_empty_queue_creates_initiative() {
    let profile = r#"
codename: atlas
system_prompt: You are the CTO.
bootstrap_initiatives:
  - title: Ship the weekly newsletter
    description: keep the community warm
    revenueImpact: 6
    effort: 2
    suggestedAssignee: cmo
"#;
    let f = fixture(ScriptedLlm::new(r#"{"summary": "nothing to do"}"#), profile);
    let daemon = start(&f).await;

    daemon.request_loop(Trigger::Scheduled, None).await.unwrap();

    wait_for(|| async { !f.tracker.all_titles().await.unwrap().is_empty() }).await;

    // One LLM call (the loop itself; the initiative came from the backlog)
    assert_eq!(f.llm.calls(), 1);
    // External issue opened, cooldown persisted, task routed to the assignee
    assert_eq!(f.tracker.all_titles().await.unwrap(), vec!["Ship the weekly newsletter"]);
    let cooldown = f.store.get_state("agent-1", "initiative_cooldown_until").await.unwrap();
    assert!(cooldown.is_some());
    assert_eq!(f.broker.list_len("queue:tasks:cmo").await.unwrap(), 1);
    assert_eq!(f.store.events_of_type("initiative_created").await.len(), 1);

    daemon.stop().await;
}

// =============================================================================
// Scenario: claim and ack
// =============================================================================

#[tokio::test]
async fn test_claim_and_ack_clears_both_lists() {
    let f = fixture(ScriptedLlm::new(r#"{"summary": "handled A and B"}"#), PLAIN_PROFILE);
    f.broker
        .list_push_back(
            "queue:tasks:cto",
            vec![
                json!({"title": "A", "priority": "high"}).to_string(),
                json!({"title": "B", "priority": "normal"}).to_string(),
            ],
        )
        .await
        .unwrap();

    let daemon = start(&f).await;
    // Startup already schedules a catch-up loop for the pending tasks;
    // wait for it to land
    wait_for(|| async {
        f.store
            .get_state("agent-1", "success_count")
            .await
            .unwrap()
            .is_some_and(|v| v == "1")
    })
    .await;

    assert_eq!(f.broker.list_len("queue:tasks:cto").await.unwrap(), 0);
    assert_eq!(f.broker.list_len("queue:tasks:cto:processing").await.unwrap(), 0);

    daemon.stop().await;
}

// =============================================================================
// Scenario: crash recovery
// =============================================================================

#[tokio::test]
async fn test_crash_recovery_preserves_head_order() {
    let f = fixture(ScriptedLlm::new(r#"{"summary": "ok"}"#), PLAIN_PROFILE);
    f.broker
        .list_push_back("queue:tasks:cto:processing", vec![json!({"title": "C"}).to_string()])
        .await
        .unwrap();
    f.broker
        .list_push_back("queue:tasks:cto", vec![json!({"title": "D"}).to_string()])
        .await
        .unwrap();

    // Recovery happens before any loop can claim
    f.store.register_agent("cto", "agent-1").await;
    let mut config = f.config.clone();
    config.loop_enabled = false;
    let daemon = AgentDaemon::start(config, f.runtime.clone(), Arc::new(NoopInvoker))
        .await
        .unwrap();

    assert_eq!(f.broker.list_len("queue:tasks:cto:processing").await.unwrap(), 0);
    let head = f.broker.list_peek("queue:tasks:cto", 2).await.unwrap();
    assert!(head[0].contains("\"C\""));
    assert!(head[1].contains("\"D\""));

    daemon.stop().await;
}

// =============================================================================
// Scenario: messages arriving during a loop
// =============================================================================

#[tokio::test]
async fn test_messages_during_loop_are_deferred_in_order() {
    let f = fixture(
        ScriptedLlm::with_latency(r#"{"summary": "slow thinking"}"#, Duration::from_millis(300)),
        PLAIN_PROFILE,
    );
    let daemon = start(&f).await;
    // Park the initiative phase so every LLM call below belongs to a loop
    f.store
        .set_state("agent-1", "initiative_cooldown_until", "2999-01-01T00:00:00+00:00")
        .await
        .unwrap();
    let channel = channels::agent_channel("agent-1");

    // Kick off a loop, then deliver three messages while it runs
    let kick = Message::new(MessageType::Task, "coo", "cto", json!({"text": "start"}));
    f.broker.publish(&channel, kick.encode()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let broadcast = Message::new(MessageType::Broadcast, "cmo", "broadcast", json!({}));
    let task = Message::new(MessageType::Task, "cmo", "cto", json!({"text": "next"}));
    let status = Message::new(MessageType::StatusRequest, "ceo", "cto", json!({}));
    f.broker.publish(&channel, broadcast.encode()).await.unwrap();
    f.broker.publish(&channel, task.encode()).await.unwrap();
    f.broker.publish(&channel, status.encode()).await.unwrap();

    // The broadcast is inline; the other two each trigger one more loop
    wait_for(|| async { daemon.health().await.loop_count == 3 }).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(daemon.health().await.loop_count, 3);
    assert_eq!(f.llm.calls(), 3);

    daemon.stop().await;
}

// =============================================================================
// Single-flight: no two loops overlap
// =============================================================================

#[tokio::test]
async fn test_loops_never_overlap() {
    let f = fixture(
        ScriptedLlm::with_latency(r#"{"summary": "busy"}"#, Duration::from_millis(100)),
        PLAIN_PROFILE,
    );
    let daemon = start(&f).await;
    f.store
        .set_state("agent-1", "initiative_cooldown_until", "2999-01-01T00:00:00+00:00")
        .await
        .unwrap();
    let channel = channels::agent_channel("agent-1");

    for i in 0..5 {
        let message = Message::new(MessageType::Task, "coo", "cto", json!({"text": i}));
        f.broker.publish(&channel, message.encode()).await.unwrap();
    }

    wait_for(|| async { daemon.health().await.loop_count == 5 }).await;
    assert_eq!(f.llm.max_in_flight(), 1);

    daemon.stop().await;
}

// =============================================================================
// Scenario: priority-based rescheduling
// =============================================================================

fn build_runner(f: &Fixture, profile: Profile) -> (LoopRunner, Arc<TaskQueue>) {
    let profile = Arc::new(profile);
    let state = StateManager::new(f.store.clone(), "agent-1", "cto");
    let queue = Arc::new(TaskQueue::new(f.broker.clone() as Arc<dyn Broker>, "cto"));
    let temp = std::env::temp_dir().join("ad-test-mcp");
    let workers = Arc::new(WorkerSpawner::new(
        "agent-1",
        "cto",
        Arc::new(NoopInvoker),
        f.broker.clone(),
        f.tracker.clone(),
        Arc::new(MemoryRag::new()),
        McpConfigCache::new(temp, ToolCatalog::default()),
        vec![],
        WorkerLimits::default(),
        f.runtime.write_limiter.clone(),
        false,
    ));
    let initiatives = Arc::new(InitiativeEngine::new(
        f.runtime.clone(),
        state.clone(),
        profile.clone(),
        "cto",
    ));
    let dispatcher = Arc::new(ActionDispatcher::new(
        f.runtime.clone(),
        "agent-1",
        "cto",
        Tier::CLevel,
        workers,
        initiatives.clone(),
        None,
    ));
    let runner = LoopRunner::new(
        f.runtime.clone(),
        state,
        queue.clone(),
        dispatcher,
        initiatives,
        None,
        Arc::new(StatusSink::new(None, "cto")),
        profile,
        PromptBuilder::new().unwrap(),
        "agent-1",
        "cto",
        Tier::CLevel,
    );
    (runner, queue)
}

#[tokio::test]
async fn test_urgent_queue_head_schedules_five_second_delay() {
    let f = fixture(ScriptedLlm::new(r#"{"summary": "worked"}"#), PLAIN_PROFILE);
    f.store.register_agent("cto", "agent-1").await;

    // Twelve pending tasks: the loop claims ten, two urgent ones remain
    let mut payloads: Vec<String> = (0..10)
        .map(|i| json!({"title": format!("t{}", i), "priority": "normal"}).to_string())
        .collect();
    payloads.push(json!({"title": "u1", "priority": "urgent"}).to_string());
    payloads.push(json!({"title": "u2", "priority": "urgent"}).to_string());
    f.broker.list_push_back("queue:tasks:cto", payloads).await.unwrap();

    let profile = Profile {
        codename: "atlas".into(),
        system_prompt: "You are the CTO.".into(),
        startup_prompt: None,
        focus: Default::default(),
        allowed_tools: vec![],
        bootstrap_initiatives: vec![],
    };
    let (runner, queue) = build_runner(&f, profile);

    let outcome = runner.run(Trigger::TaskNotification, None).await;
    assert!(outcome.success);
    assert_eq!(queue.count().await.unwrap(), 2);
    assert_eq!(outcome.next_delay, Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_concurrency_cap_leaves_tasks_pending() {
    let f = fixture(ScriptedLlm::new(r#"{"summary": "capped"}"#), PLAIN_PROFILE);
    f.store.register_agent("cto", "agent-1").await;

    // Cap is 2 and two tracker items are already in progress
    f.tracker.seed_issue("wip 1", "in_progress", "cto").await;
    f.tracker.seed_issue("wip 2", "in_progress", "cto").await;
    f.broker
        .list_push_back("queue:tasks:cto", vec![json!({"title": "waiting"}).to_string()])
        .await
        .unwrap();

    let profile = Profile {
        codename: "atlas".into(),
        system_prompt: "You are the CTO.".into(),
        startup_prompt: None,
        focus: Default::default(),
        allowed_tools: vec![],
        bootstrap_initiatives: vec![],
    };
    let (runner, queue) = build_runner(&f, profile);

    let outcome = runner.run(Trigger::TaskNotification, None).await;
    assert!(outcome.success);
    // Nothing claimed: the task is still pending, not in processing
    assert_eq!(queue.count().await.unwrap(), 1);
    assert_eq!(queue.processing_count().await.unwrap(), 0);
}

// =============================================================================
// Scenario: action retry
// =============================================================================

/// Tracker whose set_status fails a fixed number of times first
struct FlakyTracker {
    inner: MemoryTracker,
    failures_left: AtomicUsize,
}

#[async_trait]
impl IssueTracker for FlakyTracker {
    async fn snapshot(&self, agent_type: &str) -> Result<KanbanSnapshot, StoreError> {
        self.inner.snapshot(agent_type).await
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
        assignee: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.inner.create_issue(title, body, labels, assignee).await
    }

    async fn set_status(&self, number: u64, status: &str) -> Result<(), StoreError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("flaky".into()));
        }
        self.inner.set_status(number, status).await
    }

    async fn comment(&self, number: u64, body: &str) -> Result<(), StoreError> {
        self.inner.comment(number, body).await
    }

    async fn all_titles(&self) -> Result<Vec<String>, StoreError> {
        self.inner.all_titles().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_action_retry_succeeds_third_attempt_without_dead_letter() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let tracker = Arc::new(FlakyTracker {
        inner: MemoryTracker::new(),
        failures_left: AtomicUsize::new(2),
    });
    let n = tracker.inner.seed_issue("work", "ready", "cto").await;

    let runtime = Arc::new(
        Runtime::new(
            broker.clone(),
            store.clone(),
            Arc::new(MemoryRag::new()),
            tracker.clone(),
            Arc::new(LlmRouter::new(Arc::new(ScriptedLlm::new("{}")))),
        )
        .with_settings(RuntimeSettings::default()),
    );
    let state = StateManager::new(store.clone(), "agent-1", "cto");
    let profile = Arc::new(Profile {
        codename: "atlas".into(),
        system_prompt: "s".into(),
        startup_prompt: None,
        focus: Default::default(),
        allowed_tools: vec![],
        bootstrap_initiatives: vec![],
    });
    let initiatives = Arc::new(InitiativeEngine::new(runtime.clone(), state, profile, "cto"));
    let workers = Arc::new(WorkerSpawner::new(
        "agent-1",
        "cto",
        Arc::new(NoopInvoker),
        broker.clone(),
        tracker.clone(),
        Arc::new(MemoryRag::new()),
        McpConfigCache::new(std::env::temp_dir().join("ad-retry-mcp"), ToolCatalog::default()),
        vec![],
        WorkerLimits::default(),
        runtime.write_limiter.clone(),
        false,
    ));
    let dispatcher = ActionDispatcher::new(
        runtime,
        "agent-1",
        "cto",
        Tier::CLevel,
        workers,
        initiatives,
        None,
    );

    let (stats, _) = dispatcher
        .dispatch_all(
            &[Action::UpdateIssue {
                number: n,
                status: "in_progress".to_string(),
                comment: None,
            }],
            None,
        )
        .await;

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(tracker.inner.status_of(n).await, Some("in_progress".into()));
    let dead = broker.list_len(&channels::dead_letter_key("cto")).await.unwrap();
    assert_eq!(dead, 0);
}

// =============================================================================
// Duplicate initiative suppression through the whole engine
// =============================================================================

#[tokio::test]
async fn test_duplicate_initiative_title_creates_no_second_issue() {
    let profile = r#"
codename: atlas
system_prompt: You are the CTO.
bootstrap_initiatives:
  - title: Ship the weekly newsletter
    description: keep the community warm
    suggestedAssignee: cmo
"#;
    let f = fixture(ScriptedLlm::new(r#"{"summary": "idle"}"#), profile);
    // The tracker already holds a case-and-punctuation variant of the title
    f.tracker
        .seed_issue("ship the weekly newsletter!", "done", "cmo")
        .await;

    let daemon = start(&f).await;
    daemon.request_loop(Trigger::Scheduled, None).await.unwrap();

    wait_for(|| async { daemon.health().await.loop_count == 1 }).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Only the seeded issue exists; no duplicate was created. The AI
    // fallback also declined (scripted reply proposes nothing), so the run
    // ends silently-but-accounted via the duplicate guard skipping bootstrap.
    assert_eq!(f.tracker.all_titles().await.unwrap().len(), 1);

    daemon.stop().await;
}
