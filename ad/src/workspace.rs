//! Per-agent git workspace
//!
//! Agents that produce files get a private clone. After a loop, changed
//! files run through the commit pipeline: either a direct push to the
//! default branch or a category-tagged branch pushed for a PR.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use tracing::{debug, info, warn};

/// How workspace changes leave the clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMode {
    /// Commit and push straight to the default branch
    Direct,
    /// Commit on a fresh branch named after the category, push it for review
    Pr { category: String },
}

/// What the pipeline did
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub branch: String,
    pub message: String,
    pub files: Vec<String>,
    pub pushed: bool,
}

/// Handle to one agent's workspace clone
pub struct WorkspaceManager {
    root: PathBuf,
    agent_type: String,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, agent_type: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        debug!(?args, root = %self.root.display(), "git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(eyre!("git {:?} failed: {}", args, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Initialise the workspace at startup: clone when a remote is given and
    /// the directory is not a repo yet, otherwise leave it alone.
    pub async fn ensure_clone(&self, remote: Option<&str>) -> Result<()> {
        if self.root.join(".git").exists() {
            debug!(root = %self.root.display(), "Workspace already cloned");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root).await?;
        match remote {
            Some(remote) => {
                info!(remote, root = %self.root.display(), "Cloning workspace");
                let output = tokio::process::Command::new("git")
                    .args(["clone", remote, "."])
                    .current_dir(&self.root)
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(eyre!(
                        "Workspace clone failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                Ok(())
            }
            None => {
                info!(root = %self.root.display(), "Initialising empty workspace");
                self.git(&["init"]).await?;
                Ok(())
            }
        }
    }

    /// Files with uncommitted changes, from `git status --porcelain`
    pub async fn changed_files(&self) -> Vec<String> {
        match self.git(&["status", "--porcelain"]).await {
            Ok(status) => status
                .lines()
                .filter(|line| line.len() > 3)
                .map(|line| line[3..].to_string())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read workspace status");
                Vec::new()
            }
        }
    }

    /// Stage everything, commit, and push according to the mode.
    /// Returns `None` when there was nothing to commit.
    pub async fn commit_pipeline(&self, mode: CommitMode, message: &str) -> Result<Option<CommitOutcome>> {
        let files = self.changed_files().await;
        if files.is_empty() {
            debug!("Commit pipeline: workspace clean");
            return Ok(None);
        }

        let branch = match &mode {
            CommitMode::Direct => self.current_branch().await?,
            CommitMode::Pr { category } => {
                let branch = format!(
                    "agent/{}/{}-{}",
                    self.agent_type,
                    category,
                    chrono::Utc::now().format("%Y%m%d%H%M%S")
                );
                self.git(&["checkout", "-b", &branch]).await?;
                branch
            }
        };

        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", message]).await?;
        info!(branch = %branch, files = files.len(), "Workspace committed");

        // Push is best-effort: a workspace without a remote still commits
        let push_args: Vec<&str> = match &mode {
            CommitMode::Direct => vec!["push", "origin", &branch],
            CommitMode::Pr { .. } => vec!["push", "-u", "origin", &branch],
        };
        let pushed = match self.git(&push_args).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Workspace push failed");
                false
            }
        };

        Ok(Some(CommitOutcome {
            branch,
            message: message.to_string(),
            files,
            pushed,
        }))
    }

    async fn current_branch(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?.trim().to_string())
    }
}
