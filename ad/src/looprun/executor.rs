//! LoopRunner - one end-to-end loop execution
//!
//! Gathers context, invokes the LLM through the router or the session pool,
//! applies the parsed output, and decides what happens next: a delayed
//! re-trigger while work is pending, or the initiative phase when idle.

use std::sync::Arc;
use std::time::Duration;

use msgfabric::{Broker, Claimed, TaskQueue, channels};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::actions::ActionDispatcher;
use crate::domain::{
    Message, MessageType, Priority, StateTaskSpec, Task, Tier, Trigger,
};
use crate::initiative::{InitiativeEngine, InitiativeOutcome};
use crate::llm::{
    CompletionRequest, Complexity, LoopOutput, TaskContext, parser,
};
use crate::profile::Profile;
use crate::rag::RagStore as _;
use crate::runtime::Runtime;
use crate::state::{EssentialState, StateManager};
use crate::status::{CoarseStatus, StatusSink};
use crate::store::Store as _;
use crate::tracker::{IssueTracker as _, KanbanSnapshot};
use crate::workspace::{CommitMode, WorkspaceManager};

use super::PromptBuilder;

/// Max tasks claimed per loop
const CLAIM_BATCH: usize = 10;

/// RAG retrieval shape
const RAG_TOP_K: usize = 5;
const RAG_MAX_CHARS: usize = 1500;

/// Queue entries peeked for the priority-delay decision
const PEEK_DEPTH: usize = 5;

/// Default per-loop LLM deadline
const LOOP_LLM_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything gathered before the LLM call
pub struct LoopContext {
    pub trigger: Trigger,
    pub message: Option<Message>,
    pub essential: EssentialState,
    pub decisions: Vec<crate::domain::Decision>,
    pub tasks: Vec<Claimed<Task>>,
    pub rag_context: String,
    pub kanban: KanbanSnapshot,
    pub brand: Option<String>,
    pub initiative_context: Option<String>,
}

/// What one loop concluded
#[derive(Debug)]
pub struct LoopOutcome {
    pub success: bool,
    /// Delay before the next loop when pending work remains
    pub next_delay: Option<Duration>,
    /// Result of the initiative phase when it ran
    pub initiative: Option<InitiativeOutcome>,
}

/// Executes loops for one agent. Single-flight is enforced by the daemon.
pub struct LoopRunner {
    runtime: Arc<Runtime>,
    state: StateManager,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<ActionDispatcher>,
    initiatives: Arc<InitiativeEngine>,
    workspace: Option<Arc<WorkspaceManager>>,
    status: Arc<StatusSink>,
    profile: Arc<Profile>,
    prompts: PromptBuilder,
    agent_id: String,
    agent_type: String,
    tier: Tier,
}

impl LoopRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<Runtime>,
        state: StateManager,
        queue: Arc<TaskQueue>,
        dispatcher: Arc<ActionDispatcher>,
        initiatives: Arc<InitiativeEngine>,
        workspace: Option<Arc<WorkspaceManager>>,
        status: Arc<StatusSink>,
        profile: Arc<Profile>,
        prompts: PromptBuilder,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Self {
            runtime,
            state,
            queue,
            dispatcher,
            initiatives,
            workspace,
            status,
            profile,
            prompts,
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            tier,
        }
    }

    /// Run one loop end to end
    pub async fn run(&self, trigger: Trigger, message: Option<Message>) -> LoopOutcome {
        let loop_count = self.state.increment_loop_count().await.unwrap_or(0);
        info!(agent = %self.agent_type, agent_id = %self.agent_id, %trigger, loop_count, "Loop starting");
        self.status.publish(CoarseStatus::Working).await;

        let ctx = match self.gather(trigger, message).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "Context gathering failed");
                let _ = self.state.record_error(&e).await;
                self.status.publish(CoarseStatus::Blocked).await;
                let _ = self.state.touch_last_loop_at().await;
                return LoopOutcome {
                    success: false,
                    next_delay: None,
                    initiative: None,
                };
            }
        };

        let outcome = self.invoke_and_apply(&ctx).await;

        let _ = self.state.touch_last_loop_at().await;
        self.status
            .publish(if outcome { CoarseStatus::Idle } else { CoarseStatus::Blocked })
            .await;

        // More work pending: schedule per the head-of-queue priority.
        // Otherwise the idle initiative phase may run.
        let pending = self.queue.count().await.unwrap_or(0);
        let (next_delay, initiative) = if pending > 0 {
            (Some(self.next_delay().await), None)
        } else if outcome && ctx.trigger.allows_initiative() {
            let result = self.initiatives.run(ctx.trigger).await;
            match result {
                Ok(initiative) => (None, Some(initiative)),
                Err(e) => {
                    warn!(error = %e, "Initiative phase failed");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        info!(agent = %self.agent_type, success = outcome, pending, "Loop finished");
        LoopOutcome {
            success: outcome,
            next_delay,
            initiative,
        }
    }

    /// Steps 2-9: assemble the loop context
    async fn gather(&self, trigger: Trigger, message: Option<Message>) -> Result<LoopContext, String> {
        let essential = self.state.essential().await.map_err(|e| e.to_string())?;

        let decisions = if self.tier == Tier::Head {
            self.runtime.store.pending_decisions().await.map_err(|e| e.to_string())?
        } else {
            Vec::new()
        };

        let kanban = self
            .runtime
            .tracker
            .snapshot(&self.agent_type)
            .await
            .map_err(|e| e.to_string())?;

        // Concurrency cap: with enough work already in progress, claim
        // nothing so pending tasks stay pending.
        let cap = self.runtime.settings.read().await.max_concurrent_tasks;
        let mut tasks: Vec<Claimed<Task>> = if kanban.in_progress.len() >= cap {
            info!(
                in_progress = kanban.in_progress.len(),
                cap, "Concurrency cap reached, claiming no tasks"
            );
            Vec::new()
        } else {
            self.queue.claim(CLAIM_BATCH).await.map_err(|e| e.to_string())?
        };
        tasks.sort_by(|a, b| b.item.priority.cmp(&a.item.priority));

        let rag_context = match self
            .runtime
            .rag
            .query(&crate::rag::RagQuery {
                codename: self.profile.codename.clone(),
                trigger: trigger.as_str().to_string(),
                text: message.as_ref().and_then(|m| m.payload.get("text")).and_then(|v| v.as_str()).map(str::to_string),
                top_k: RAG_TOP_K,
            })
            .await
        {
            Ok(hits) => crate::rag::join_hits(&hits, RAG_MAX_CHARS),
            Err(e) => {
                debug!(error = %e, "RAG query failed");
                String::new()
            }
        };

        let brand = self
            .runtime
            .store
            .get_setting("brand.config")
            .await
            .map_err(|e| e.to_string())?;

        // Idle loops carry initiative guidance; the startup loop carries the
        // profile's startup prompt instead.
        let initiative_context = if trigger == Trigger::Startup {
            self.profile.startup_prompt.clone()
        } else if tasks.is_empty() && decisions.is_empty() && message.is_none() {
            Some(
                "The task queue is empty. If nothing needs attention, consider proposing \
                 one initiative with a propose_initiative action."
                    .to_string(),
            )
        } else {
            None
        };

        Ok(LoopContext {
            trigger,
            message,
            essential,
            decisions,
            tasks,
            rag_context,
            kanban,
            brand,
            initiative_context,
        })
    }

    /// Steps 10-12: the LLM call and everything it causes
    async fn invoke_and_apply(&self, ctx: &LoopContext) -> bool {
        let text = match self.invoke_llm(ctx).await {
            Ok(text) => text,
            Err(e) => {
                // Claimed tasks stay in processing for startup recovery
                warn!(error = %e, "LLM invocation failed, batch left in processing");
                let _ = self.state.record_error(&e).await;
                return false;
            }
        };

        // State-machine tasks are answered regardless of the main output
        if let Some(message) = &ctx.message {
            if message.kind == MessageType::StateTask {
                self.answer_state_task(message, &text).await;
            }
        }

        let output = match parser::parse_loop_output(&text) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Unparseable LLM output, batch left in processing");
                let _ = self.state.record_error(&format!("parse: {}", e)).await;
                return false;
            }
        };

        self.apply_output(ctx, output).await
    }

    async fn invoke_llm(&self, ctx: &LoopContext) -> Result<String, String> {
        // Session-pool mode sends the trimmed delta; profile context is
        // already resident in the conversation
        if let Some(pool) = &self.runtime.session_pool {
            let prompt = self.prompts.build_delta(&self.profile, ctx).map_err(|e| e.to_string())?;
            return pool.send(&self.agent_type, &prompt).await.map_err(|e| e.to_string());
        }

        let prompt = self.prompts.build(&self.profile, ctx).map_err(|e| e.to_string())?;
        let task_ctx = TaskContext {
            reasoning: self.tier == Tier::Head || !ctx.decisions.is_empty(),
            complexity: if ctx.tasks.len() >= 5 {
                Complexity::High
            } else if ctx.tasks.is_empty() {
                Complexity::Low
            } else {
                Complexity::Medium
            },
            priority: ctx.tasks.first().map(|c| c.item.priority).unwrap_or_default(),
        };
        let request = CompletionRequest::new(&self.profile.system_prompt, prompt).with_timeout(LOOP_LLM_TIMEOUT);
        self.runtime
            .router
            .complete(&task_ctx, request)
            .await
            .map(|r| r.text)
            .map_err(|e| e.to_string())
    }

    /// Step 11: apply a successfully parsed output
    async fn apply_output(&self, ctx: &LoopContext, output: LoopOutput) -> bool {
        if let Err(e) = self.state.apply_updates(&output.state_updates).await {
            warn!(error = %e, "State updates failed");
        }

        let correlation_id = ctx.message.as_ref().map(|m| m.trace_id().to_string());

        for outbound in &output.messages {
            self.emit_message(outbound, correlation_id.as_deref()).await;
        }

        let (stats, workspace_handled) = self
            .dispatcher
            .dispatch_all(&output.actions, correlation_id.as_deref())
            .await;
        debug!(?stats, "Actions dispatched");

        let summary = output.summary.clone().unwrap_or_else(|| format!("{} loop", ctx.trigger));
        if let Err(e) = self
            .state
            .record_history(
                "loop",
                &summary,
                json!({
                    "trigger": ctx.trigger.as_str(),
                    "tasks": ctx.tasks.len(),
                    "actions": output.actions.len(),
                }),
            )
            .await
        {
            warn!(error = %e, "History append failed");
        }

        // File-change sweep, unless an explicit commit action already ran
        if !workspace_handled {
            if let Some(workspace) = &self.workspace {
                if !workspace.changed_files().await.is_empty() {
                    match workspace.commit_pipeline(CommitMode::Direct, &summary).await {
                        Ok(Some(outcome)) => info!(branch = %outcome.branch, "Workspace changes committed"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Workspace commit sweep failed"),
                    }
                }
            }
        }

        if let Err(e) = self.queue.ack(&ctx.tasks).await {
            warn!(error = %e, "Task ack failed, batch will be recovered");
            let _ = self.state.record_error(&format!("ack: {}", e)).await;
            return false;
        }

        let _ = self.state.record_success().await;
        true
    }

    /// Route a declared outbound message
    async fn emit_message(&self, outbound: &crate::llm::OutboundMessage, correlation_id: Option<&str>) {
        let message = Message::new(
            outbound.kind.clone(),
            &self.agent_type,
            &outbound.to,
            outbound.payload.clone(),
        )
        .with_priority(outbound.priority)
        .with_correlation(correlation_id.map(str::to_string));

        let channel = match outbound.to.as_str() {
            "broadcast" => channels::BROADCAST.to_string(),
            "head" | "clevel" => outbound.to.clone(),
            // Agent types and ids route through the orchestrator
            _ => channels::ORCHESTRATOR.to_string(),
        };
        if let Err(e) = self.runtime.broker.publish(&channel, message.encode()).await {
            warn!(error = %e, channel = %channel, "Outbound message publish failed");
        }
    }

    /// Answer a state-machine task: its STATE_OUTPUT block or a failure ack
    async fn answer_state_task(&self, message: &Message, text: &str) {
        let Some(spec) = StateTaskSpec::from_payload(&message.payload) else {
            warn!("state_task message without a valid spec payload");
            return;
        };

        let payload = match parser::parse_state_output(text, &spec.required_fields) {
            Ok(value) => json!({ "id": spec.id, "output": value }),
            Err(e) => {
                warn!(error = %e, id = %spec.id, "State task failed");
                json!({ "id": spec.id, "error": e.to_string() })
            }
        };

        let reply = Message::new(
            MessageType::Other("state_output".to_string()),
            &self.agent_type,
            &message.from,
            payload,
        )
        .with_correlation(Some(message.trace_id().to_string()));

        let _ = self
            .runtime
            .broker
            .publish(channels::ORCHESTRATOR, reply.encode())
            .await;
    }

    /// Head-of-queue priority decides the delay before the next loop
    async fn next_delay(&self) -> Duration {
        let head = self.queue.peek(PEEK_DEPTH).await.unwrap_or_default();
        let top = head
            .iter()
            .filter_map(|raw| serde_json::from_str::<Task>(raw).ok())
            .map(|t| t.priority)
            .max()
            .unwrap_or(Priority::Normal);
        let delay = self.runtime.settings.read().await.delay_for(top.as_str());
        debug!(priority = %top, ?delay, "Next loop scheduled from queue head");
        delay
    }
}
