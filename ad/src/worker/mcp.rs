//! Tool-server config generation
//!
//! Workers receive a config file describing the tool servers they may talk
//! to. Files are cached by (sorted tool list, dry-run flag): the same
//! combination reuses the same file. In dry-run mode write-capable servers
//! are removed from the effective set before the file is written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::spawner::WorkerError;

/// One tool server in the catalogue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Write-capable servers are fenced off in dry-run mode
    #[serde(default)]
    pub write_capable: bool,
}

/// The base catalogue of known tool servers, loaded from `MCP_CONFIG_PATH`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCatalog {
    pub servers: Vec<ToolServer>,
}

impl ToolCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| WorkerError::Config(format!("read catalogue: {}", e)))?;
        serde_json::from_str(&content).map_err(|e| WorkerError::Config(format!("parse catalogue: {}", e)))
    }

    pub fn get(&self, name: &str) -> Option<&ToolServer> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Cache of generated config files, process-global and read-mostly
pub struct McpConfigCache {
    dir: PathBuf,
    catalog: ToolCatalog,
    cache: Mutex<HashMap<String, PathBuf>>,
}

impl McpConfigCache {
    pub fn new(dir: impl Into<PathBuf>, catalog: ToolCatalog) -> Self {
        Self {
            dir: dir.into(),
            catalog,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(tools: &[String], dry_run: bool) -> String {
        let mut sorted: Vec<&str> = tools.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        format!("{}:{}", sorted.join("+"), if dry_run { "dry" } else { "live" })
    }

    /// Resolve (or generate) the config file for a tool set. Returns the
    /// file path and the effective tool list after the dry-run fence.
    pub async fn config_for(
        &self,
        tools: &[String],
        dry_run: bool,
    ) -> Result<(PathBuf, Vec<String>), WorkerError> {
        let effective: Vec<&ToolServer> = tools
            .iter()
            .filter_map(|name| self.catalog.get(name))
            .filter(|server| !(dry_run && server.write_capable))
            .collect();
        let effective_names: Vec<String> = effective.iter().map(|s| s.name.clone()).collect();

        let key = Self::cache_key(tools, dry_run);
        {
            let cache = self.cache.lock().await;
            if let Some(path) = cache.get(&key) {
                debug!(key = %key, "Config cache hit");
                return Ok((path.clone(), effective_names));
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| WorkerError::Config(format!("create config dir: {}", e)))?;

        let file_name = format!(
            "mcp-{:016x}.json",
            key.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
        );
        let path = self.dir.join(file_name);

        let body = serde_json::json!({
            "mcpServers": effective
                .iter()
                .map(|s| (s.name.clone(), serde_json::json!({ "command": s.command, "args": s.args })))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
        });
        tokio::fs::write(&path, serde_json::to_string_pretty(&body).unwrap_or_default())
            .await
            .map_err(|e| WorkerError::Config(format!("write config: {}", e)))?;
        info!(path = %path.display(), tools = ?effective_names, dry_run, "Generated tool config");

        let mut cache = self.cache.lock().await;
        cache.insert(key, path.clone());
        Ok((path, effective_names))
    }
}
