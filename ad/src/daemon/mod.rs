//! Agent daemon lifecycle
//!
//! `start()` walks the startup sequence (profile, agent id, recovery,
//! subscriptions, ticker, status), then a single processor task executes
//! loop requests one at a time. Trigger sources - ticker, pub/sub listeners,
//! stream consumer, queue wakeups - all feed the same bounded channel, which
//! doubles as the FIFO for messages arriving while a loop is in flight.

mod http;
mod process;
mod ticker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Context as _, Result, eyre};
use msgfabric::{Broker, StreamConsumer, Subscription, TaskQueue, channels};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

pub use process::{ProcessManager, VERSION};
pub use ticker::cron_expr;

use crate::actions::ActionDispatcher;
use crate::config::{DaemonConfig, RuntimeSettings};
use crate::domain::{Message, MessageType, Trigger, WorkerOutcome, should_trigger_ai};
use crate::initiative::InitiativeEngine;
use crate::llm::PoolStats;
use crate::looprun::{LoopRunner, PromptBuilder};
use crate::profile::Profile;
use crate::runtime::Runtime;
use crate::state::StateManager;
use crate::status::{StatusSink, fleet_status};
use crate::store::Store as _;
use crate::worker::{McpConfigCache, ToolCatalog, WorkerInvoker, WorkerLimits, WorkerSpawner};
use crate::workspace::WorkspaceManager;

/// Capacity of the loop-request channel; AI-requiring messages queue here
/// while a loop holds the single-flight lock
const REQUEST_FIFO_CAPACITY: usize = 64;

/// Base delay before the startup_queue loop when tasks were already pending;
/// a per-process jitter is added on top
const STARTUP_QUEUE_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// One queued loop execution
#[derive(Debug)]
pub struct LoopRequest {
    pub trigger: Trigger,
    pub message: Option<Message>,
}

/// Health object served on `/health` and returned by [`AgentDaemon::health`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub running: bool,
    pub agent_type: String,
    pub status: String,
    pub loop_count: u64,
    pub last_loop_at: Option<String>,
    pub llm_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_pool: Option<PoolStats>,
}

/// State shared with the health server and the dispatch path
pub struct DaemonShared {
    agent_type: String,
    running: AtomicBool,
    llm_available: AtomicBool,
    loop_in_progress: Arc<AtomicBool>,
    state: StateManager,
    session_pool: Option<Arc<crate::llm::SessionPool>>,
}

impl DaemonShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn health(&self) -> HealthReport {
        let essential = self.state.essential().await.unwrap_or_default();
        let running = self.is_running();
        let session_pool = match &self.session_pool {
            Some(pool) => Some(pool.stats().await),
            None => None,
        };
        HealthReport {
            running,
            agent_type: self.agent_type.clone(),
            status: fleet_status(running, essential.last_error.as_deref()).to_string(),
            loop_count: essential.loop_count,
            last_loop_at: essential.last_loop_at,
            llm_available: self.llm_available.load(Ordering::SeqCst),
            session_pool,
        }
    }
}

/// The message dispatch core shared by every listener task
struct Dispatch {
    agent_type: String,
    state: StateManager,
    runtime: Arc<Runtime>,
    request_tx: mpsc::Sender<LoopRequest>,
    loop_in_progress: Arc<AtomicBool>,
    shared: Arc<DaemonShared>,
}

impl Dispatch {
    /// Handle one inbound message. Errors are reported to the caller (the
    /// stream consumer withholds its ack on them) but never unwind further.
    async fn handle(&self, message: Message) -> Result<(), String> {
        let span = tracing::info_span!(
            "message",
            trace_id = %message.trace_id(),
            kind = %message.kind,
            from = %message.from,
        );
        self.handle_inner(message).instrument(span).await
    }

    async fn handle_inner(&self, message: Message) -> Result<(), String> {
        // Worker results always feed passive extraction, AI or not
        if message.kind == MessageType::WorkerResult {
            if let Ok(outcome) = serde_json::from_value::<WorkerOutcome>(message.payload.clone()) {
                if let Err(e) = self.state.apply_worker_result(&outcome.task, &outcome.result).await {
                    warn!(error = %e, "Passive extraction failed");
                }
            }
        }

        if should_trigger_ai(&message) {
            // Mid-loop arrivals are deferred in the request FIFO and drained
            // in arrival order once the lock is released
            let trigger = if self.loop_in_progress.load(Ordering::SeqCst) {
                Trigger::QueuedMessage
            } else {
                Trigger::Message
            };
            debug!(%trigger, "Message requires AI");
            return self
                .request_tx
                .try_send(LoopRequest {
                    trigger,
                    message: Some(message),
                })
                .map_err(|e| format!("loop request queue rejected message: {}", e));
        }

        // Non-AI messages are handled inline and never queue
        match &message.kind {
            MessageType::StatusRequest => {
                let health = self.shared.health().await;
                let reply = Message::new(
                    MessageType::StatusResponse,
                    &self.agent_type,
                    &message.from,
                    json!({
                        "status": health.status,
                        "loopCount": health.loop_count,
                        "lastLoopAt": health.last_loop_at,
                    }),
                )
                .with_correlation(Some(message.trace_id().to_string()));
                self.runtime
                    .broker
                    .publish(channels::ORCHESTRATOR, reply.encode())
                    .await
                    .map_err(|e| e.to_string())?;
            }
            MessageType::Broadcast => {
                info!(from = %message.from, "Broadcast received");
            }
            MessageType::TaskQueued => {
                debug!("Task queued wakeup");
                let _ = self.request_tx.try_send(LoopRequest {
                    trigger: Trigger::TaskNotification,
                    message: None,
                });
            }
            MessageType::StatusResponse => {
                debug!(from = %message.from, "Status response noted");
            }
            other => {
                debug!(kind = %other, "Message routed to ignored sink");
            }
        }
        Ok(())
    }
}

/// One running agent daemon
pub struct AgentDaemon {
    config: DaemonConfig,
    runtime: Arc<Runtime>,
    agent_id: String,
    shared: Arc<DaemonShared>,
    queue: Arc<TaskQueue>,
    request_tx: mpsc::Sender<LoopRequest>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl AgentDaemon {
    /// Start the daemon: the full startup sequence, ending with the
    /// processor, listener, consumer, ticker and health tasks running.
    pub async fn start(
        config: DaemonConfig,
        runtime: Arc<Runtime>,
        invoker: Arc<dyn WorkerInvoker>,
    ) -> Result<Arc<Self>> {
        let agent_type = config.agent_type.as_str().to_string();
        info!(agent_type = %agent_type, "Agent daemon starting");

        if let Some(url) = &config.orchestrator_url {
            // Intents travel over the orchestrator channel; the HTTP endpoint
            // is for deployments that bridge the channel over HTTP
            info!(orchestrator = %url, "Orchestrator endpoint configured");
        }

        // (1) profile
        let profile = Arc::new(Profile::load(&config.profile_path)?);

        // (2) persistent agent id; unknown agents are a fatal start error
        let agent_id = match &config.agent_id_override {
            Some(id) => id.clone(),
            None => runtime
                .store
                .agent_id_for_type(&agent_type)
                .await?
                .ok_or_else(|| eyre!("No agent of type '{}' registered in the store", agent_type))?,
        };
        info!(agent_id = %agent_id, "Resolved agent id");

        // (3) state manager bound to the id
        let state = StateManager::new(runtime.store.clone(), &agent_id, &agent_type);

        // (4) runtime settings through the labelled reload path
        {
            let settings = RuntimeSettings::reload(&runtime.store).await;
            *runtime.settings.write().await = settings;
        }

        // (5) orphaned-task recovery
        let queue = Arc::new(TaskQueue::new(runtime.broker.clone(), &agent_type));
        let recovered = queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "Requeued orphaned tasks");
        }

        // (6) optional workspace clone
        let workspace = match &config.workspace_dir {
            Some(dir) => {
                let ws = Arc::new(WorkspaceManager::new(dir, &agent_type));
                ws.ensure_clone(None).await?;
                Some(ws)
            }
            None => None,
        };

        // (7) LLM availability probe
        let llm_available = runtime.router.probe().await;
        if !llm_available {
            warn!("LLM provider probe failed; loops will error until it recovers");
        }

        let loop_in_progress = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(DaemonShared {
            agent_type: agent_type.clone(),
            running: AtomicBool::new(true),
            llm_available: AtomicBool::new(llm_available),
            loop_in_progress: loop_in_progress.clone(),
            state: state.clone(),
            session_pool: runtime.session_pool.clone(),
        });

        // Wire the execution stack
        let catalog = match &config.mcp_config_path {
            Some(path) => ToolCatalog::load(path).unwrap_or_else(|e| {
                warn!(error = %e, "Tool catalogue unavailable, workers get no tools");
                ToolCatalog::default()
            }),
            None => ToolCatalog::default(),
        };
        let mcp_dir = std::env::temp_dir().join("agentdaemon-mcp");
        let workers = Arc::new(WorkerSpawner::new(
            &agent_id,
            &agent_type,
            invoker,
            runtime.broker.clone(),
            runtime.tracker.clone(),
            runtime.rag.clone(),
            McpConfigCache::new(mcp_dir, catalog),
            profile.allowed_tools.clone(),
            WorkerLimits {
                max_concurrent: config.worker_max_concurrent,
                ..Default::default()
            },
            runtime.write_limiter.clone(),
            runtime.dry_run,
        ));
        let initiatives = Arc::new(InitiativeEngine::new(
            runtime.clone(),
            state.clone(),
            profile.clone(),
            &agent_type,
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            runtime.clone(),
            &agent_id,
            &agent_type,
            config.agent_type.tier(),
            workers,
            initiatives.clone(),
            workspace.clone(),
        ));
        let status = Arc::new(StatusSink::new(config.status_service_url.clone(), &agent_type));
        let runner = Arc::new(LoopRunner::new(
            runtime.clone(),
            state.clone(),
            queue.clone(),
            dispatcher,
            initiatives,
            workspace,
            status,
            profile.clone(),
            PromptBuilder::new()?,
            &agent_id,
            &agent_type,
            config.agent_type.tier(),
        ));

        let (request_tx, request_rx) = mpsc::channel(REQUEST_FIFO_CAPACITY);
        let mut handles = Vec::new();

        // The processor: single consumer, hence single-flight
        handles.push(Self::spawn_processor(
            runner,
            request_rx,
            request_tx.clone(),
            loop_in_progress.clone(),
        ));

        let dispatch = Arc::new(Dispatch {
            agent_type: agent_type.clone(),
            state: state.clone(),
            runtime: runtime.clone(),
            request_tx: request_tx.clone(),
            loop_in_progress,
            shared: shared.clone(),
        });

        // (8) pub/sub subscriptions and the durable stream group
        for channel in [
            channels::agent_channel(&agent_id),
            channels::tier_channel(config.agent_type.tier().channel()),
            channels::BROADCAST.to_string(),
        ] {
            let sub = runtime
                .broker
                .subscribe(&channel)
                .await
                .with_context(|| format!("Failed to subscribe to {}", channel))?;
            handles.push(Self::spawn_listener(sub, dispatch.clone()));
        }

        let consumer = Arc::new(StreamConsumer::new(runtime.broker.clone(), &agent_id, &agent_type));
        consumer.ensure_group().await?;
        // Crash recovery: reprocess entries another incarnation left pending
        let stale = consumer.reclaim_stale().await?;
        for entry in stale {
            Self::process_stream_entry(&consumer, &dispatch, &entry).await;
        }
        handles.push(Self::spawn_stream_consumer(consumer, dispatch.clone()));

        // (9) scheduled trigger
        if config.loop_enabled {
            info!(
                interval = config.loop_interval_secs,
                cron = %cron_expr(config.loop_interval_secs),
                "Scheduling recurring loop"
            );
            handles.push(ticker::spawn_ticker(request_tx.clone(), config.loop_interval_secs));
        } else {
            info!("Scheduled loops disabled");
        }

        // Health endpoint
        handles.push(http::spawn_health_server(shared.clone(), config.health_port));

        // (10) fleet registry: active
        runtime
            .store
            .set_agent_status(&agent_id, fleet_status(true, None))
            .await?;

        // (11) startup loop when the profile asks for one
        if profile.startup_prompt.is_some() {
            let _ = request_tx
                .send(LoopRequest {
                    trigger: Trigger::Startup,
                    message: None,
                })
                .await;
        }

        // (12) pending work left from before this start
        let pending = queue.count().await?;
        if pending > 0 {
            info!(pending, "Pending tasks at startup, scheduling catch-up loop");
            let jitter = std::time::Duration::from_millis(rand::random_range(0..500));
            let tx = request_tx.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(STARTUP_QUEUE_DELAY + jitter).await;
                let _ = tx
                    .send(LoopRequest {
                        trigger: Trigger::StartupQueue,
                        message: None,
                    })
                    .await;
            }));
        }

        info!(agent_type = %agent_type, "Agent daemon started");
        Ok(Arc::new(Self {
            config,
            runtime,
            agent_id,
            shared,
            queue,
            request_tx,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }))
    }

    fn spawn_processor(
        runner: Arc<LoopRunner>,
        mut request_rx: mpsc::Receiver<LoopRequest>,
        request_tx: mpsc::Sender<LoopRequest>,
        loop_in_progress: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                // The processor is the only consumer, so this can only trip
                // if a second processor was ever spawned
                if loop_in_progress.swap(true, Ordering::SeqCst) {
                    warn!("Loop already in progress, dropping request");
                    continue;
                }
                let outcome = runner.run(request.trigger, request.message).await;
                loop_in_progress.store(false, Ordering::SeqCst);

                if let Some(delay) = outcome.next_delay {
                    let tx = request_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx
                            .send(LoopRequest {
                                trigger: Trigger::QueueContinuation,
                                message: None,
                            })
                            .await;
                    });
                }
            }
            debug!("Loop processor exiting");
        })
    }

    fn spawn_listener(mut sub: Subscription, dispatch: Arc<Dispatch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(payload) = sub.recv().await {
                match serde_json::from_str::<Message>(&payload) {
                    Ok(message) => {
                        // One bad handler outcome must not kill the daemon
                        if let Err(e) = dispatch.handle(message).await {
                            warn!(channel = %sub.channel(), error = %e, "Message handling failed");
                        }
                    }
                    Err(e) => {
                        warn!(channel = %sub.channel(), error = %e, "Undecodable message payload");
                    }
                }
            }
            debug!("Listener exiting");
        })
    }

    async fn process_stream_entry(consumer: &StreamConsumer, dispatch: &Arc<Dispatch>, entry: &msgfabric::StreamEntry) {
        match serde_json::from_str::<Message>(&entry.payload) {
            Ok(message) => match dispatch.handle(message).await {
                Ok(()) => {
                    let _ = consumer.ack(&entry.id).await;
                }
                Err(e) => {
                    // No ack: the entry stays pending for redelivery
                    warn!(entry = %entry.id, error = %e, "Stream dispatch failed, left pending");
                }
            },
            Err(e) => {
                // Poison entries are acked away, or they would redeliver forever
                warn!(entry = %entry.id, error = %e, "Undecodable stream entry, discarding");
                let _ = consumer.ack(&entry.id).await;
            }
        }
    }

    fn spawn_stream_consumer(consumer: Arc<StreamConsumer>, dispatch: Arc<Dispatch>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match consumer.read().await {
                    Ok(entries) => {
                        for entry in &entries {
                            Self::process_stream_entry(&consumer, &dispatch, entry).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Stream read failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    /// Queue a loop request from outside (tests, CLI wake-ups)
    pub async fn request_loop(&self, trigger: Trigger, message: Option<Message>) -> Result<()> {
        self.request_tx
            .send(LoopRequest { trigger, message })
            .await
            .map_err(|_| eyre!("Daemon is shutting down"))
    }

    /// Current health object
    pub async fn health(&self) -> HealthReport {
        self.shared.health().await
    }

    /// Pending task count (diagnostics)
    pub async fn pending_tasks(&self) -> usize {
        self.queue.count().await.unwrap_or(0)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Stop the daemon. Idempotent. The fleet registry keeps `active`:
    /// that status means "should be running", so a supervisor restarts us.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stop called twice, ignoring");
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }

        if let Some(pool) = &self.runtime.session_pool {
            pool.shutdown().await;
        }

        info!(agent_type = %self.shared.agent_type, "agent_stopped");
    }
}
