//! Subprocess workers
//!
//! Short-lived LLM subprocesses that execute one task against external tool
//! servers, bounded by a per-parent concurrency cap and a process-wide write
//! rate limit against the issue tracker.

mod knowledge;
mod mcp;
mod ratelimit;
mod spawner;

pub use knowledge::{augment_task, find_blocked_domains};
pub use mcp::{McpConfigCache, ToolCatalog, ToolServer};
pub use ratelimit::WriteLimiter;
pub use spawner::{CliInvoker, WorkerError, WorkerInvoker, WorkerLimits, WorkerSpawner};
