//! Daemon configuration
//!
//! [`DaemonConfig`] is built once at startup from the environment.
//! [`RuntimeSettings`] (priority-delay table, concurrency cap) come from the
//! relational settings table and are mutable only through the labelled
//! reload path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::AgentType;
use crate::store::Store;

/// Runtime parameters for one daemon, resolved from the environment
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub agent_type: AgentType,
    /// Explicit agent id override; normally resolved from the store
    pub agent_id_override: Option<String>,
    pub profile_path: String,
    pub loop_interval_secs: u64,
    pub loop_enabled: bool,
    pub orchestrator_url: Option<String>,
    pub health_port: u16,
    pub status_service_url: Option<String>,
    pub worker_max_concurrent: usize,
    pub session_pool_enabled: bool,
    pub session_max_loops: u32,
    pub session_idle_timeout: Duration,
    pub dry_run: bool,
    pub mcp_config_path: Option<String>,
    pub workspace_dir: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            agent_type: AgentType::Ceo,
            agent_id_override: None,
            profile_path: "profile.yml".to_string(),
            loop_interval_secs: 3600,
            loop_enabled: true,
            orchestrator_url: None,
            health_port: 3001,
            status_service_url: None,
            worker_max_concurrent: 3,
            session_pool_enabled: false,
            session_max_loops: 20,
            session_idle_timeout: Duration::from_secs(600),
            dry_run: false,
            mcp_config_path: None,
            workspace_dir: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl DaemonConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = env_var("AGENT_TYPE") {
            config.agent_type = AgentType::parse(&raw)
                .ok_or_else(|| eyre::eyre!("Unknown AGENT_TYPE: '{}'", raw))?;
        }
        config.agent_id_override = env_var("AGENT_ID");
        if let Some(path) = env_var("PROFILE_PATH") {
            config.profile_path = path;
        }
        if let Some(raw) = env_var("LOOP_INTERVAL") {
            config.loop_interval_secs = raw
                .parse()
                .with_context(|| format!("Invalid LOOP_INTERVAL: '{}'", raw))?;
        }
        if let Some(raw) = env_var("LOOP_ENABLED") {
            config.loop_enabled = raw != "false";
        }
        config.orchestrator_url = env_var("ORCHESTRATOR_URL");
        if let Some(raw) = env_var("HEALTH_PORT") {
            config.health_port = raw.parse().with_context(|| format!("Invalid HEALTH_PORT: '{}'", raw))?;
        }
        config.status_service_url = env_var("STATUS_SERVICE_URL");
        if let Some(raw) = env_var("WORKER_MAX_CONCURRENT") {
            config.worker_max_concurrent = raw
                .parse()
                .with_context(|| format!("Invalid WORKER_MAX_CONCURRENT: '{}'", raw))?;
        }
        config.session_pool_enabled = env_var("SESSION_POOL_ENABLED").is_some_and(|v| v == "true");
        if let Some(raw) = env_var("SESSION_MAX_LOOPS") {
            config.session_max_loops = raw
                .parse()
                .with_context(|| format!("Invalid SESSION_MAX_LOOPS: '{}'", raw))?;
        }
        if let Some(raw) = env_var("SESSION_IDLE_TIMEOUT_MS") {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("Invalid SESSION_IDLE_TIMEOUT_MS: '{}'", raw))?;
            config.session_idle_timeout = Duration::from_millis(ms);
        }
        config.dry_run = env_var("DRY_RUN").is_some_and(|v| v == "true" || v == "1");
        config.mcp_config_path = env_var("MCP_CONFIG_PATH");
        config.workspace_dir = env_var("WORKSPACE_DIR");

        Ok(config)
    }
}

/// Default priority-delay table in seconds
fn default_delays() -> HashMap<String, u64> {
    HashMap::from([
        ("critical".to_string(), 0),
        ("urgent".to_string(), 5),
        ("high".to_string(), 30),
        ("normal".to_string(), 120),
        ("low".to_string(), 300),
        ("operational".to_string(), 600),
    ])
}

/// Settings loaded from the relational store, reloadable at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Delay before the next loop, per head-of-queue priority
    pub priority_delays: HashMap<String, u64>,
    /// Tracker in-progress items allowed before claimed tasks are dropped
    /// from the loop context
    pub max_concurrent_tasks: usize,
    /// Initiative cooldown per agent
    pub initiative_cooldown_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            priority_delays: default_delays(),
            max_concurrent_tasks: 2,
            initiative_cooldown_secs: 3600,
        }
    }
}

impl RuntimeSettings {
    /// Load from the settings table; absent or malformed keys keep defaults
    pub async fn load(store: &Arc<dyn Store>) -> Self {
        let mut settings = Self::default();

        match store.get_setting("runtime.priority_delays").await {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, u64>>(&raw) {
                Ok(overrides) => settings.priority_delays.extend(overrides),
                Err(e) => warn!(error = %e, "Ignoring malformed runtime.priority_delays setting"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read runtime.priority_delays"),
        }

        if let Ok(Some(raw)) = store.get_setting("runtime.max_concurrent_tasks").await {
            match raw.parse() {
                Ok(n) => settings.max_concurrent_tasks = n,
                Err(_) => warn!(value = %raw, "Ignoring malformed runtime.max_concurrent_tasks"),
            }
        }

        if let Ok(Some(raw)) = store.get_setting("runtime.initiative_cooldown_secs").await {
            match raw.parse() {
                Ok(n) => settings.initiative_cooldown_secs = n,
                Err(_) => warn!(value = %raw, "Ignoring malformed runtime.initiative_cooldown_secs"),
            }
        }

        settings
    }

    /// Labelled reload path: settings never change except through here
    pub async fn reload(store: &Arc<dyn Store>) -> Self {
        let settings = Self::load(store).await;
        info!(max_concurrent_tasks = settings.max_concurrent_tasks, "settings_reload");
        settings
    }

    /// Delay before the next loop for a head-of-queue priority class.
    /// A missing table entry falls back to normal.
    pub fn delay_for(&self, priority: &str) -> Duration {
        let secs = self
            .priority_delays
            .get(priority)
            .or_else(|| self.priority_delays.get("normal"))
            .copied()
            .unwrap_or(120);
        Duration::from_secs(secs)
    }
}
