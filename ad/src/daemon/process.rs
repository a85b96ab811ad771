//! Daemon process management
//!
//! PID-file bookkeeping and process control for the CLI: background start
//! re-execs the binary with `run-daemon`, stop delivers SIGTERM and
//! escalates, and a version file beside the PID file lets the CLI detect a
//! stale daemon after an upgrade.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use tracing::{debug, info, warn};

/// Crate version, written to the version file at registration
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_pid_path(agent_type: &str) -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("agentdaemon")
        .join(format!("{}.pid", agent_type))
}

/// PID/version file manager for one agent's daemon process
#[derive(Debug)]
pub struct ProcessManager {
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl ProcessManager {
    /// Manager for the per-agent default PID file location
    pub fn for_agent(agent_type: &str) -> Self {
        Self::with_pid_file(default_pid_path(agent_type))
    }

    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        let version_file = pid_file.with_extension("version");
        Self {
            pid_file,
            version_file,
        }
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| process_alive(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_file).ok()?.trim().parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        fs::write(&self.pid_file, pid.to_string()).context("Failed to write PID file")?;
        debug!(pid, path = ?self.pid_file, "Wrote PID file");
        Ok(())
    }

    pub fn read_version(&self) -> Option<String> {
        fs::read_to_string(&self.version_file)
            .ok()
            .map(|v| v.trim().to_string())
    }

    /// Whether the running daemon was built from this binary's version
    pub fn version_matches(&self) -> bool {
        self.read_version().as_deref() == Some(VERSION)
    }

    /// Register the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        if let Some(parent) = self.version_file.parent() {
            fs::create_dir_all(parent).context("Failed to create version file directory")?;
        }
        fs::write(&self.version_file, VERSION).context("Failed to write version file")?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Fork the daemon into the background via `run-daemon`
    pub fn start_background(&self) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }
        let exe = std::env::current_exe().context("Failed to resolve current executable")?;
        let child = Command::new(&exe)
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started in background");
        Ok(pid)
    }

    /// Stop the daemon: SIGTERM, bounded wait, SIGKILL as a last resort
    pub fn stop(&self) -> Result<()> {
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon");
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;
        }

        let mut attempts = 0;
        while process_alive(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }
        if process_alive(pid) {
            warn!(pid, "Daemon ignored SIGTERM, sending SIGKILL");
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        self.cleanup();
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Remove the PID and version files
    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.pid_file);
        let _ = fs::remove_file(&self.version_file);
    }
}

/// Signal 0 probes for existence without affecting the process
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
