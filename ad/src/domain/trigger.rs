//! Named reasons a loop runs

use serde::{Deserialize, Serialize};

/// Why a loop was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Recurring ticker fired
    Scheduled,
    /// An inbound message required AI
    Message,
    /// A task_queued wakeup arrived
    TaskNotification,
    /// First loop after start, driven by the profile's startup prompt
    Startup,
    /// Delayed loop scheduled at start because tasks were already pending
    StartupQueue,
    /// Re-trigger after a loop left pending work behind
    QueueContinuation,
    /// Replay of a message that arrived mid-loop
    QueuedMessage,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Message => "message",
            Self::TaskNotification => "task_notification",
            Self::Startup => "startup",
            Self::StartupQueue => "startup_queue",
            Self::QueueContinuation => "queue_continuation",
            Self::QueuedMessage => "queued_message",
        }
    }

    /// Whether the idle initiative phase may follow a loop with this trigger
    pub fn allows_initiative(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Message)
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
