//! Worker spawner
//!
//! Spawns one bounded LLM subprocess per task. Claims beyond the per-parent
//! concurrency cap fail permanently; there is no queueing. Results travel
//! back to the parent's private channel as `worker_result` messages.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msgfabric::{Broker, channels};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{Message, MessageType, Priority, WorkerOutcome, WorkerTask};
use crate::llm::parser::extract_json;
use crate::rag::{API_PATTERNS, RagQuery, RagStore, join_hits};
use crate::store::StoreError;
use crate::tracker::IssueTracker;

use super::mcp::McpConfigCache;
use super::ratelimit::WriteLimiter;
use super::{augment_task, find_blocked_domains};

/// Worker failure taxonomy
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker concurrency cap reached ({0})")]
    CapReached(usize),

    #[error("Invalid worker task: {0}")]
    InvalidTask(String),

    #[error("Tool '{0}' is not in the parent's allow-list")]
    ToolNotAllowed(String),

    #[error("Tool config error: {0}")]
    Config(String),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tracker error: {0}")]
    Tracker(#[from] StoreError),
}

impl WorkerError {
    /// Cap exhaustion and shape errors are permanent: retrying the same
    /// spawn cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            WorkerError::CapReached(_) | WorkerError::InvalidTask(_) | WorkerError::ToolNotAllowed(_)
        )
    }
}

/// Timeouts and caps for worker execution
#[derive(Debug, Clone)]
pub struct WorkerLimits {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    /// Image generation is slow; tasks requesting such a tool get more time
    pub image_timeout: Duration,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_timeout: Duration::from_secs(60),
            image_timeout: Duration::from_secs(180),
        }
    }
}

/// Runs the actual worker subprocess; the LLM CLI provider is external
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn invoke(&self, config_path: &Path, prompt: &str, timeout: Duration) -> Result<String, WorkerError>;
}

/// Invoker shelling out to the configured LLM CLI
pub struct CliInvoker {
    command: String,
    base_args: Vec<String>,
}

impl CliInvoker {
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
        }
    }
}

#[async_trait]
impl WorkerInvoker for CliInvoker {
    async fn invoke(&self, config_path: &Path, prompt: &str, timeout: Duration) -> Result<String, WorkerError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.base_args)
            .arg("--mcp-config")
            .arg(config_path)
            .arg("-p")
            .arg(prompt)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        // Drain stdout concurrently so a chatty worker cannot deadlock on a
        // full pipe
        let stdout = child.stdout.take();
        let reader = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf).await;
            }
            buf
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_status)) => Ok(reader.await.unwrap_or_default()),
            Ok(Err(e)) => Err(WorkerError::Spawn(e.to_string())),
            Err(_) => {
                warn!(command = %self.command, ?timeout, "Worker timed out, sending SIGTERM");
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                // Short grace period, then hard kill
                if tokio::time::timeout(Duration::from_secs(2), child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
                Err(WorkerError::Timeout(timeout))
            }
        }
    }
}

/// Guard decrementing the parent's active-worker count on drop
struct SlotGuard {
    active: Arc<Mutex<HashMap<String, usize>>>,
    parent: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let active = self.active.clone();
        let parent = self.parent.clone();
        tokio::spawn(async move {
            let mut map = active.lock().await;
            if let Some(count) = map.get_mut(&parent) {
                *count = count.saturating_sub(1);
            }
        });
    }
}

/// Spawns and supervises subprocess workers for one parent agent
pub struct WorkerSpawner {
    parent_agent_id: String,
    parent_agent_type: String,
    invoker: Arc<dyn WorkerInvoker>,
    broker: Arc<dyn Broker>,
    tracker: Arc<dyn IssueTracker>,
    rag: Arc<dyn RagStore>,
    mcp: McpConfigCache,
    allowed_tools: Vec<String>,
    limits: WorkerLimits,
    write_limiter: Arc<WriteLimiter>,
    dry_run: bool,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl WorkerSpawner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_agent_id: impl Into<String>,
        parent_agent_type: impl Into<String>,
        invoker: Arc<dyn WorkerInvoker>,
        broker: Arc<dyn Broker>,
        tracker: Arc<dyn IssueTracker>,
        rag: Arc<dyn RagStore>,
        mcp: McpConfigCache,
        allowed_tools: Vec<String>,
        limits: WorkerLimits,
        write_limiter: Arc<WriteLimiter>,
        dry_run: bool,
    ) -> Self {
        Self {
            parent_agent_id: parent_agent_id.into(),
            parent_agent_type: parent_agent_type.into(),
            invoker,
            broker,
            tracker,
            rag,
            mcp,
            allowed_tools,
            limits,
            write_limiter,
            dry_run,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Active worker count for this parent (diagnostics)
    pub async fn active_count(&self) -> usize {
        let map = self.active.lock().await;
        map.get(&self.parent_agent_id).copied().unwrap_or(0)
    }

    async fn claim_slot(&self) -> Result<SlotGuard, WorkerError> {
        let mut map = self.active.lock().await;
        let count = map.entry(self.parent_agent_id.clone()).or_insert(0);
        if *count >= self.limits.max_concurrent {
            return Err(WorkerError::CapReached(self.limits.max_concurrent));
        }
        *count += 1;
        Ok(SlotGuard {
            active: self.active.clone(),
            parent: self.parent_agent_id.clone(),
        })
    }

    fn timeout_for(&self, task: &WorkerTask) -> Duration {
        if let Some(secs) = task.timeout_secs {
            return Duration::from_secs(secs);
        }
        let wants_image = task.tools.iter().any(|t| t.contains("image"));
        if wants_image {
            self.limits.image_timeout
        } else {
            self.limits.default_timeout
        }
    }

    /// Run one worker task to completion and deliver the result to the
    /// parent's private channel.
    pub async fn spawn(&self, task: WorkerTask, correlation_id: Option<String>) -> Result<WorkerOutcome, WorkerError> {
        let _slot = self.claim_slot().await?;
        task.validate().map_err(WorkerError::InvalidTask)?;

        for tool in &task.tools {
            if !self.allowed_tools.contains(tool) {
                return Err(WorkerError::ToolNotAllowed(tool.clone()));
            }
        }

        let (config_path, effective_tools) = self.mcp.config_for(&task.tools, self.dry_run).await?;
        debug!(task_id = %task.id, tools = ?effective_tools, "Worker tool config ready");

        // Previously successful API patterns for similar tasks
        let patterns = match self
            .rag
            .query(&RagQuery {
                codename: API_PATTERNS.to_string(),
                trigger: task.kind.clone(),
                text: Some(task.task.clone()),
                top_k: 3,
            })
            .await
        {
            Ok(hits) => join_hits(&hits, 600),
            Err(e) => {
                debug!(error = %e, "API pattern lookup failed");
                String::new()
            }
        };

        let prompt = augment_task(&task.task, self.dry_run, Some(patterns.as_str()));
        let timeout = self.timeout_for(&task);
        info!(task_id = %task.id, kind = %task.kind, ?timeout, "Spawning worker");

        let outcome = match self.invoker.invoke(&config_path, &prompt, timeout).await {
            Ok(output) => self.interpret_output(&task, &output).await?,
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Worker failed");
                let mut failure = WorkerOutcome::failure(&task.id, e.to_string());
                failure.task = task.task.clone();
                failure
            }
        };

        self.deliver(&outcome, correlation_id).await;
        Ok(outcome)
    }

    /// Scan worker output for a JSON result and for blocked domains
    async fn interpret_output(&self, task: &WorkerTask, output: &str) -> Result<WorkerOutcome, WorkerError> {
        let blocked = find_blocked_domains(output);
        if !blocked.is_empty() {
            warn!(task_id = %task.id, ?blocked, "Worker touched blocked domains");
            self.request_domain_approval(task, &blocked).await?;
            let mut failure = WorkerOutcome::failure(&task.id, format!("blocked domains: {}", blocked.join(", ")));
            failure.task = task.task.clone();
            return Ok(failure);
        }

        let structured = extract_json(output);
        let result = structured
            .as_ref()
            .and_then(|v| v.get("result"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| output.trim().to_string());
        let api_used = structured
            .as_ref()
            .and_then(|v| v.get("apiUsed"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // Successful API usage feeds future workers through RAG
        if let Some(api) = &api_used {
            let content = format!("task '{}' succeeded with API: {}", task.task, api);
            if let Err(e) = self.rag.index(API_PATTERNS, &task.id, &content).await {
                debug!(error = %e, "Failed to index API pattern");
            }
        }

        Ok(WorkerOutcome {
            task_id: task.id.clone(),
            task: task.task.clone(),
            success: true,
            result,
            api_used,
            error: None,
            structured,
        })
    }

    /// Open an approval request and broadcast `domain_approval_needed`
    async fn request_domain_approval(&self, task: &WorkerTask, blocked: &[String]) -> Result<(), WorkerError> {
        self.write_limiter.acquire().await;
        let title = format!("Domain approval needed: {}", blocked.join(", "));
        let body = format!(
            "Worker task '{}' ({}) attempted to reach non-whitelisted domains:\n{}",
            task.id,
            task.kind,
            blocked.join("\n")
        );
        let labels = vec!["domain-approval".to_string(), format!("agent:{}", self.parent_agent_type)];
        self.tracker.create_issue(&title, &body, &labels, None).await?;

        let broadcast = Message::new(
            MessageType::Other("domain_approval_needed".to_string()),
            &self.parent_agent_type,
            channels::BROADCAST,
            serde_json::json!({ "taskId": task.id, "domains": blocked }),
        );
        let _ = self.broker.publish(channels::BROADCAST, broadcast.encode()).await;
        Ok(())
    }

    /// Wrap the outcome as a worker_result message on the parent's channel
    async fn deliver(&self, outcome: &WorkerOutcome, correlation_id: Option<String>) {
        let message = Message::new(
            MessageType::WorkerResult,
            format!("worker:{}", outcome.task_id),
            &self.parent_agent_id,
            serde_json::to_value(outcome).unwrap_or_default(),
        )
        .with_priority(Priority::Normal)
        .with_correlation(correlation_id);

        let channel = channels::agent_channel(&self.parent_agent_id);
        if let Err(e) = self.broker.publish(&channel, message.encode()).await {
            warn!(error = %e, "Failed to deliver worker result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::MemoryRag;
    use crate::tracker::MemoryTracker;
    use crate::worker::{ToolCatalog, ToolServer};
    use msgfabric::MemoryBroker;
    use tempfile::TempDir;

    struct ScriptedInvoker {
        output: String,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl WorkerInvoker for ScriptedInvoker {
        async fn invoke(&self, _config: &Path, _prompt: &str, timeout: Duration) -> Result<String, WorkerError> {
            if let Some(delay) = self.delay {
                if delay > timeout {
                    return Err(WorkerError::Timeout(timeout));
                }
            }
            Ok(self.output.clone())
        }
    }

    fn catalog() -> ToolCatalog {
        ToolCatalog {
            servers: vec![
                ToolServer {
                    name: "web".into(),
                    command: "web-server".into(),
                    args: vec![],
                    write_capable: false,
                },
                ToolServer {
                    name: "image-gen".into(),
                    command: "image-server".into(),
                    args: vec![],
                    write_capable: true,
                },
            ],
        }
    }

    struct Fixture {
        broker: Arc<MemoryBroker>,
        tracker: Arc<MemoryTracker>,
        spawner: WorkerSpawner,
        _temp: TempDir,
    }

    fn fixture(output: &str, max_concurrent: usize) -> Fixture {
        let temp = TempDir::new().unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let tracker = Arc::new(MemoryTracker::new());
        let spawner = WorkerSpawner::new(
            "agent-1",
            "cto",
            Arc::new(ScriptedInvoker {
                output: output.to_string(),
                delay: None,
            }),
            broker.clone(),
            tracker.clone(),
            Arc::new(MemoryRag::new()),
            McpConfigCache::new(temp.path(), catalog()),
            vec!["web".into(), "image-gen".into()],
            WorkerLimits {
                max_concurrent,
                ..Default::default()
            },
            Arc::new(WriteLimiter::per_second(100)),
            false,
        );
        Fixture {
            broker,
            tracker,
            spawner,
            _temp: temp,
        }
    }

    fn task() -> WorkerTask {
        WorkerTask {
            id: "w1".into(),
            kind: "research".into(),
            task: "fetch the price".into(),
            tools: vec!["web".into()],
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_successful_worker_delivers_result() {
        let f = fixture(r#"{"result": "price is $1", "apiUsed": "coingecko"}"#, 3);
        let mut sub = f.broker.subscribe("agent:agent-1").await.unwrap();

        let outcome = f.spawner.spawn(task(), Some("trace-1".into())).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, "price is $1");
        assert_eq!(outcome.api_used.as_deref(), Some("coingecko"));

        let delivered: Message = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(delivered.kind, MessageType::WorkerResult);
        assert_eq!(delivered.correlation_id.as_deref(), Some("trace-1"));
    }

    #[tokio::test]
    async fn test_cap_exhaustion_is_permanent() {
        let f = fixture("{}", 0);
        let err = f.spawner.spawn(task(), None).await.unwrap_err();
        assert!(matches!(err, WorkerError::CapReached(0)));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_disallowed_tool_is_rejected() {
        let f = fixture("{}", 3);
        let mut t = task();
        t.tools = vec!["filesystem".into()];
        let err = f.spawner.spawn(t, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::ToolNotAllowed(tool) if tool == "filesystem"));
    }

    #[tokio::test]
    async fn test_invalid_shape_is_rejected() {
        let f = fixture("{}", 3);
        let mut t = task();
        t.task = String::new();
        assert!(matches!(
            f.spawner.spawn(t, None).await.unwrap_err(),
            WorkerError::InvalidTask(_)
        ));
    }

    #[tokio::test]
    async fn test_blocked_domain_opens_approval_and_fails() {
        let f = fixture("I scraped https://shady.example.org/data for you", 3);
        let mut sub = f.broker.subscribe(channels::BROADCAST).await.unwrap();

        let outcome = f.spawner.spawn(task(), None).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or("").contains("shady.example.org"));

        let titles = f.tracker.all_titles().await.unwrap();
        assert_eq!(titles.len(), 1);
        assert!(titles[0].contains("Domain approval needed"));

        let broadcast: Message = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(broadcast.kind.as_str(), "domain_approval_needed");
    }

    #[tokio::test]
    async fn test_image_tool_lengthens_timeout() {
        let f = fixture("{}", 3);
        let mut t = task();
        t.tools = vec!["image-gen".into()];
        assert_eq!(f.spawner.timeout_for(&t), Duration::from_secs(180));
        assert_eq!(f.spawner.timeout_for(&task()), Duration::from_secs(60));

        let mut t = task();
        t.timeout_secs = Some(7);
        assert_eq!(f.spawner.timeout_for(&t), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_slot_released_after_completion() {
        let f = fixture("{}", 1);
        f.spawner.spawn(task(), None).await.unwrap();
        // Guard decrements asynchronously; give it a tick
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.spawner.active_count().await, 0);

        // A second spawn fits again
        assert!(f.spawner.spawn(task(), None).await.is_ok());
    }
}
