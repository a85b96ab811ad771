//! CLI definition

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Agent daemon for one organisational role
#[derive(Parser, Debug)]
#[command(name = "ad", version, about)]
pub struct Cli {
    /// Log level override (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the daemon process
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Run as the daemon process (internal; use `daemon start`)
    RunDaemon,

    /// Query the running daemon's health endpoint
    Health,

    /// Show the daemon log
    Logs {
        /// Follow the log as it grows
        #[arg(long, short)]
        follow: bool,

        /// Number of trailing lines to show
        #[arg(long, short = 'n', default_value_t = 100)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Run in the foreground instead of forking
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Show daemon status
    Status {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check that the daemon process answers its readiness probe
    Ping,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Log file location shared by the daemon and `ad logs`
pub fn log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdaemon")
        .join("logs")
        .join("ad.log")
}
