//! Runtime - explicit collaborator wiring
//!
//! Everything the daemon talks to lives here as a field: broker, relational
//! store, RAG store, issue tracker, LLM router, optional session pool,
//! runtime settings, and the process-wide tracker write limiter. Components
//! receive the `Runtime` instead of reaching for globals.

use std::sync::Arc;

use msgfabric::Broker;
use tokio::sync::RwLock;

use crate::config::RuntimeSettings;
use crate::llm::{LlmRouter, SessionPool};
use crate::rag::RagStore;
use crate::store::Store;
use crate::tracker::IssueTracker;
use crate::worker::WriteLimiter;

/// Shared collaborators of one daemon process
pub struct Runtime {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn Store>,
    pub rag: Arc<dyn RagStore>,
    pub tracker: Arc<dyn IssueTracker>,
    pub router: Arc<LlmRouter>,
    pub session_pool: Option<Arc<SessionPool>>,
    /// Mutable only through [`RuntimeSettings::reload`]
    pub settings: Arc<RwLock<RuntimeSettings>>,
    /// Token bucket shared by every tracker write in this process
    pub write_limiter: Arc<WriteLimiter>,
    /// Process-wide dry-run fence for write-capable tools
    pub dry_run: bool,
}

impl Runtime {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
        rag: Arc<dyn RagStore>,
        tracker: Arc<dyn IssueTracker>,
        router: Arc<LlmRouter>,
    ) -> Self {
        Self {
            broker,
            store,
            rag,
            tracker,
            router,
            session_pool: None,
            settings: Arc::new(RwLock::new(RuntimeSettings::default())),
            write_limiter: Arc::new(WriteLimiter::per_second(1)),
            dry_run: false,
        }
    }

    pub fn with_session_pool(mut self, pool: Arc<SessionPool>) -> Self {
        self.session_pool = Some(pool);
        self
    }

    pub fn with_settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = Arc::new(RwLock::new(settings));
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_write_limiter(mut self, limiter: Arc<WriteLimiter>) -> Self {
        self.write_limiter = limiter;
        self
    }
}
