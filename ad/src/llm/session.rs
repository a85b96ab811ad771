//! Persistent session pool
//!
//! The optional second execution mode: one long-lived provider conversation
//! per agent type, so each loop only sends a trimmed delta prompt. A session
//! is recycled after `max_loops` uses or once it has sat idle past the
//! timeout, and a failed session is discarded so the next loop opens fresh.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::LlmError;

/// One live provider conversation
#[async_trait]
pub trait LlmSession: Send {
    /// Send a prompt into the conversation and return the reply text
    async fn send(&mut self, prompt: &str) -> Result<String, LlmError>;

    /// Tear the conversation down
    async fn close(&mut self);
}

/// Opens sessions; wraps the external provider's persistent mode
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError>;
}

/// Recycling policy
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Loops served before a session is recycled
    pub max_loops: u32,
    /// Idle time before a session is evicted
    pub idle_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_loops: 20,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Busy,
}

struct Entry {
    /// Present while idle; taken out for the duration of a send
    session: Option<Box<dyn LlmSession>>,
    state: SessionState,
    loops_used: u32,
    last_used: Instant,
}

/// Pool snapshot for health reporting
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub sessions: usize,
    pub busy: usize,
    pub total_recycled: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, Entry>,
    total_recycled: u64,
}

/// What checkout decided under the lock
enum Plan {
    Reuse(Box<dyn LlmSession>),
    Recycle(Option<Box<dyn LlmSession>>),
    Open,
}

/// Supervised pool of provider sessions, keyed by agent type
pub struct SessionPool {
    factory: Box<dyn SessionFactory>,
    config: SessionPoolConfig,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub fn new(factory: Box<dyn SessionFactory>, config: SessionPoolConfig) -> Self {
        Self {
            factory,
            config,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Send a prompt through the agent's persistent session, opening or
    /// recycling one as the policy requires.
    pub async fn send(&self, agent_type: &str, prompt: &str) -> Result<String, LlmError> {
        let mut session = self.checkout(agent_type).await?;

        match session.send(prompt).await {
            Ok(text) => {
                self.checkin(agent_type, session).await;
                Ok(text)
            }
            Err(e) => {
                warn!(agent_type, error = %e, "Session failed, discarding");
                session.close().await;
                let mut inner = self.inner.lock().await;
                inner.entries.remove(agent_type);
                Err(e)
            }
        }
    }

    /// Decide under the lock, then act on the plan without holding it across
    /// the provider calls.
    async fn checkout(&self, agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError> {
        let plan = {
            let mut inner = self.inner.lock().await;
            match inner.entries.get_mut(agent_type) {
                Some(entry) if entry.state == SessionState::Busy => {
                    return Err(LlmError::Unavailable(format!(
                        "session for '{}' is busy",
                        agent_type
                    )));
                }
                Some(entry) => {
                    let expired = entry.last_used.elapsed() >= self.config.idle_timeout;
                    let exhausted = entry.loops_used >= self.config.max_loops;
                    if expired || exhausted {
                        debug!(agent_type, expired, exhausted, "Recycling session");
                        inner.total_recycled += 1;
                        let old = inner.entries.remove(agent_type).and_then(|e| e.session);
                        Plan::Recycle(old)
                    } else {
                        entry.state = SessionState::Busy;
                        match entry.session.take() {
                            Some(session) => Plan::Reuse(session),
                            None => Plan::Open,
                        }
                    }
                }
                None => Plan::Open,
            }
        };

        match plan {
            Plan::Reuse(session) => Ok(session),
            Plan::Recycle(old) => {
                if let Some(mut session) = old {
                    session.close().await;
                }
                self.open_busy(agent_type).await
            }
            Plan::Open => self.open_busy(agent_type).await,
        }
    }

    /// Open a fresh session and register its entry in the busy state
    async fn open_busy(&self, agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError> {
        info!(agent_type, "Opening new session");
        let session = self.factory.open(agent_type).await?;
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            agent_type.to_string(),
            Entry {
                session: None,
                state: SessionState::Busy,
                loops_used: 0,
                last_used: Instant::now(),
            },
        );
        Ok(session)
    }

    async fn checkin(&self, agent_type: &str, session: Box<dyn LlmSession>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(agent_type) {
            entry.session = Some(session);
            entry.state = SessionState::Idle;
            entry.loops_used += 1;
            entry.last_used = Instant::now();
        }
    }

    /// Health snapshot
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            sessions: inner.entries.len(),
            busy: inner
                .entries
                .values()
                .filter(|e| e.state == SessionState::Busy)
                .count(),
            total_recycled: inner.total_recycled,
        }
    }

    /// Close every session; called from daemon stop
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (agent_type, mut entry) in inner.entries.drain() {
            debug!(agent_type = %agent_type, "Closing session");
            if let Some(mut session) = entry.session.take() {
                session.close().await;
            }
        }
    }
}

/// Session factory over any stateless [`super::LlmClient`]: the "conversation"
/// is emulated by replaying the transcript on every send. Providers with a
/// native persistent mode get their own factory; this one makes the pool
/// usable with plain single-shot clients.
pub struct ClientSessionFactory {
    client: std::sync::Arc<dyn super::LlmClient>,
    system_prompt: String,
}

impl ClientSessionFactory {
    pub fn new(client: std::sync::Arc<dyn super::LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            system_prompt: system_prompt.into(),
        }
    }
}

struct TranscriptSession {
    client: std::sync::Arc<dyn super::LlmClient>,
    system_prompt: String,
    transcript: Vec<(String, String)>,
}

#[async_trait]
impl LlmSession for TranscriptSession {
    async fn send(&mut self, prompt: &str) -> Result<String, LlmError> {
        let mut full = String::new();
        for (earlier_prompt, earlier_reply) in &self.transcript {
            full.push_str("## Earlier exchange\n");
            full.push_str(earlier_prompt);
            full.push_str("\n\n");
            full.push_str(earlier_reply);
            full.push_str("\n\n");
        }
        full.push_str(prompt);

        let request = super::CompletionRequest::new(&self.system_prompt, full);
        let reply = self.client.complete(request).await?.text;
        self.transcript.push((prompt.to_string(), reply.clone()));
        Ok(reply)
    }

    async fn close(&mut self) {
        self.transcript.clear();
    }
}

#[async_trait]
impl SessionFactory for ClientSessionFactory {
    async fn open(&self, agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError> {
        debug!(agent_type, "Opening transcript-backed session");
        Ok(Box::new(TranscriptSession {
            client: self.client.clone(),
            system_prompt: self.system_prompt.clone(),
            transcript: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSession {
        sends: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl LlmSession for CountingSession {
        async fn send(&mut self, prompt: &str) -> Result<String, LlmError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(LlmError::Unavailable("broken".into()))
            } else {
                Ok(format!("echo: {}", prompt))
            }
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        sends: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_sessions: bool,
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn open(&self, _agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession {
                sends: self.sends.clone(),
                closes: self.closes.clone(),
                fail: self.fail_sessions,
            }))
        }
    }

    fn pool(config: SessionPoolConfig) -> (Arc<CountingFactory>, SessionPool) {
        let factory = Arc::new(CountingFactory::default());
        struct Fwd(Arc<CountingFactory>);
        #[async_trait]
        impl SessionFactory for Fwd {
            async fn open(&self, agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError> {
                self.0.open(agent_type).await
            }
        }
        let pool = SessionPool::new(Box::new(Fwd(factory.clone())), config);
        (factory, pool)
    }

    #[tokio::test]
    async fn test_session_is_reused_across_loops() {
        let (factory, pool) = pool(SessionPoolConfig::default());

        pool.send("cto", "one").await.unwrap();
        pool.send("cto", "two").await.unwrap();

        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.sessions, 1);
    }

    #[tokio::test]
    async fn test_max_loops_recycles_session() {
        let (factory, pool) = pool(SessionPoolConfig {
            max_loops: 2,
            ..Default::default()
        });

        pool.send("cto", "1").await.unwrap();
        pool.send("cto", "2").await.unwrap();
        // Third send exceeds max_loops: a new session is opened
        pool.send("cto", "3").await.unwrap();

        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.total_recycled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_evicts_session() {
        let (factory, pool) = pool(SessionPoolConfig {
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        pool.send("cto", "1").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        pool.send("cto", "2").await.unwrap();

        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().await.total_recycled, 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_discarded() {
        let factory = Arc::new(CountingFactory {
            fail_sessions: true,
            ..Default::default()
        });
        struct Fwd(Arc<CountingFactory>);
        #[async_trait]
        impl SessionFactory for Fwd {
            async fn open(&self, agent_type: &str) -> Result<Box<dyn LlmSession>, LlmError> {
                self.0.open(agent_type).await
            }
        }
        let pool = SessionPool::new(Box::new(Fwd(factory.clone())), SessionPoolConfig::default());

        assert!(pool.send("cto", "boom").await.is_err());
        assert_eq!(pool.stats().await.sessions, 0);
        assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transcript_factory_keeps_a_conversation_going() {
        use crate::llm::client::mock::MockLlmClient;

        let client = Arc::new(MockLlmClient::new(vec![
            Ok("first reply".into()),
            Ok("second reply".into()),
        ]));
        let pool = SessionPool::new(
            Box::new(ClientSessionFactory::new(client.clone(), "sys")),
            SessionPoolConfig::default(),
        );

        assert_eq!(pool.send("cto", "hello").await.unwrap(), "first reply");
        assert_eq!(pool.send("cto", "again").await.unwrap(), "second reply");
        // One session served both sends
        assert_eq!(pool.stats().await.sessions, 1);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_sessions() {
        let (factory, pool) = pool(SessionPoolConfig::default());
        pool.send("cto", "1").await.unwrap();
        pool.send("cmo", "1").await.unwrap();

        pool.shutdown().await;
        assert_eq!(factory.closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().await.sessions, 0);
    }
}
