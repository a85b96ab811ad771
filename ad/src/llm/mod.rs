//! LLM layer
//!
//! The providers themselves are external; the daemon sees them through
//! [`LlmClient`]. Two execution modes share that interface: the single-shot
//! [`LlmRouter`] and the persistent [`SessionPool`].

mod cli;
pub mod client;
mod error;
pub mod parser;
mod router;
mod session;

pub use cli::CliLlmClient;
pub use client::{CompletionRequest, CompletionResponse, LlmClient, TokenUsage};
pub use error::LlmError;
pub use parser::{LoopOutput, OutboundMessage, ParseError};
pub use router::{Complexity, LlmRouter, TaskContext};
pub use session::{
    ClientSessionFactory, LlmSession, PoolStats, SessionFactory, SessionPool, SessionPoolConfig,
};
