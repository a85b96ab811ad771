//! ad - agent daemon CLI entry point

use std::fs;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use agentdaemon::cli::{Cli, Command, DaemonCommand, OutputFormat, log_path};
use agentdaemon::config::DaemonConfig;
use agentdaemon::daemon::{AgentDaemon, ProcessManager};
use agentdaemon::llm::{
    ClientSessionFactory, CliLlmClient, LlmClient, LlmRouter, SessionPool, SessionPoolConfig,
};
use agentdaemon::profile::Profile;
use agentdaemon::rag::MemoryRag;
use agentdaemon::runtime::Runtime;
use agentdaemon::store::{MemoryStore, Store};
use agentdaemon::tracker::MemoryTracker;
use agentdaemon::worker::CliInvoker;
use msgfabric::MemoryBroker;

fn setup_logging(cli_level: Option<&str>, to_file: bool) -> Result<()> {
    let level = match cli_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: unknown log level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_file {
        let path = log_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let file = fs::File::create(&path).context("Failed to create log file")?;
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon itself logs to the shared file; one-shot commands to stderr
    let to_file = matches!(
        cli.command,
        Command::RunDaemon
            | Command::Daemon {
                command: DaemonCommand::Start { foreground: true }
            }
    );
    setup_logging(cli.log_level.as_deref(), to_file)?;

    let config = DaemonConfig::from_env().context("Invalid environment configuration")?;
    debug!(agent_type = %config.agent_type, "Configuration loaded");

    match cli.command {
        Command::Daemon { command } => match command {
            DaemonCommand::Start { foreground } => cmd_start(config, foreground).await,
            DaemonCommand::Stop => cmd_stop(&config),
            DaemonCommand::Status { format } => cmd_status(&config, format).await,
            DaemonCommand::Ping => cmd_ping(&config).await,
        },
        Command::RunDaemon => {
            let manager = ProcessManager::for_agent(config.agent_type.as_str());
            manager.register_self()?;
            run_daemon(config).await
        }
        Command::Health => cmd_health(&config).await,
        Command::Logs { follow, lines } => cmd_logs(follow, lines),
    }
}

async fn cmd_start(config: DaemonConfig, foreground: bool) -> Result<()> {
    let manager = ProcessManager::for_agent(config.agent_type.as_str());
    if let Some(pid) = manager.running_pid() {
        println!("Daemon for '{}' already running (PID {})", config.agent_type, pid);
        return Ok(());
    }

    if foreground {
        println!("Running '{}' daemon in the foreground...", config.agent_type);
        manager.register_self()?;
        let result = run_daemon(config).await;
        manager.cleanup();
        result
    } else {
        let pid = manager.start_background()?;
        println!("Daemon for '{}' started (PID {})", config.agent_type, pid);
        Ok(())
    }
}

fn cmd_stop(config: &DaemonConfig) -> Result<()> {
    let manager = ProcessManager::for_agent(config.agent_type.as_str());
    if !manager.is_running() {
        println!("Daemon for '{}' is not running", config.agent_type);
        return Ok(());
    }
    let pid = manager.running_pid();
    manager.stop()?;
    match pid {
        Some(pid) => println!("Daemon stopped (was PID {})", pid),
        None => println!("Daemon stopped"),
    }
    Ok(())
}

async fn cmd_status(config: &DaemonConfig, format: OutputFormat) -> Result<()> {
    let manager = ProcessManager::for_agent(config.agent_type.as_str());
    let pid = manager.running_pid();

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "agentType": config.agent_type.as_str(),
                "running": pid.is_some(),
                "pid": pid,
                "pidFile": manager.pid_file().to_string_lossy(),
                "versionMatches": manager.version_matches(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("Agent daemon: {}", config.agent_type);
            match pid {
                Some(pid) => {
                    println!("Status: running (PID {})", pid);
                    if !manager.version_matches() {
                        println!("Note: daemon version differs from this CLI; consider a restart");
                    }
                }
                None => println!("Status: stopped"),
            }
            println!("PID file: {}", manager.pid_file().display());
        }
    }
    Ok(())
}

async fn cmd_ping(config: &DaemonConfig) -> Result<()> {
    let url = format!("http://127.0.0.1:{}/ready", config.health_port);
    let client = reqwest::Client::new();
    match client
        .get(&url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            println!("Daemon is ready");
        }
        Ok(response) => {
            println!("Daemon answered but is not ready ({})", response.status());
        }
        Err(e) => {
            println!("Daemon unreachable at {}: {}", url, e);
        }
    }
    Ok(())
}

async fn cmd_health(config: &DaemonConfig) -> Result<()> {
    let url = format!("http://127.0.0.1:{}/health", config.health_port);
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
        .with_context(|| format!("Health endpoint unreachable at {}", url))?;
    let body: serde_json::Value = response.json().await.context("Malformed health body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    let path = log_path();
    if !path.exists() {
        println!("No log file at {}", path.display());
        return Ok(());
    }

    if follow {
        println!("Following {} (Ctrl+C to stop)", path.display());
        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&path)
            .spawn()
            .context("Failed to run tail -f")?;
        child.wait()?;
    } else {
        let file = fs::File::open(&path).context("Failed to open log file")?;
        let all: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
        let start = all.len().saturating_sub(lines);
        for line in &all[start..] {
            println!("{}", line);
        }
    }
    Ok(())
}

/// Build the runtime and run the daemon until a shutdown signal.
///
/// Collaborator endpoints (broker, store, RAG, tracker) are deployment
/// concerns; this binary wires the in-process implementations, which is the
/// single-node development mode. Production deployments substitute their own
/// adapters behind the same traits.
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!(agent_type = %config.agent_type, "Daemon process starting");

    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let rag = Arc::new(MemoryRag::new());
    let tracker = Arc::new(MemoryTracker::new());

    // With the in-process store the agent cannot pre-exist; provision it
    // here so the type lookup in the startup sequence resolves.
    if store
        .agent_id_for_type(config.agent_type.as_str())
        .await?
        .is_none()
    {
        let agent_id = config
            .agent_id_override
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        store.register_agent(config.agent_type.as_str(), &agent_id).await;
        info!(agent_id = %agent_id, "Provisioned agent in the in-process store");
    }

    // Provider CLI; LLM_COMMAND selects the binary ("claude" by default)
    let llm_command = std::env::var("LLM_COMMAND").unwrap_or_else(|_| "claude".to_string());
    let provider: Arc<dyn LlmClient> = Arc::new(CliLlmClient::new("cli", &llm_command, vec![]));
    let router = Arc::new(LlmRouter::new(provider.clone()));

    let mut runtime = Runtime::new(broker, store, rag, tracker, router).with_dry_run(config.dry_run);
    if config.session_pool_enabled {
        let profile = Profile::load(&config.profile_path)?;
        let factory = ClientSessionFactory::new(provider, profile.system_prompt);
        runtime = runtime.with_session_pool(Arc::new(SessionPool::new(
            Box::new(factory),
            SessionPoolConfig {
                max_loops: config.session_max_loops,
                idle_timeout: config.session_idle_timeout,
            },
        )));
        info!("Session pool enabled");
    }
    let runtime = Arc::new(runtime);

    let invoker = Arc::new(CliInvoker::new(&llm_command, vec![]));
    let daemon = AgentDaemon::start(config, runtime, invoker)
        .await
        .context("Daemon start failed")?;

    // SIGTERM / SIGINT drive graceful shutdown
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {
            warn!("SIGTERM received");
        }
        _ = sigint.recv() => {
            warn!("SIGINT received");
        }
    }

    daemon.stop().await;
    info!("Daemon process exiting");
    Ok(())
}
