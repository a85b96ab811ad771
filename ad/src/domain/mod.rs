//! Domain types shared across the daemon
//!
//! Messages, tasks, decisions, actions and initiatives all travel as tagged
//! JSON; here they are closed sum types with permissive decoders so an
//! unknown tag degrades to a logged no-op instead of a dead daemon.

mod action;
mod agent;
mod decision;
mod initiative;
mod message;
mod priority;
mod task;
mod trigger;
mod worker;

pub use action::{Action, Severity, VoteChoice};
pub use agent::{AgentType, Tier};
pub use decision::{Decision, DecisionTier};
pub use initiative::Initiative;
pub use message::{Message, MessageType, should_trigger_ai};
pub use priority::Priority;
pub use task::{StateTaskSpec, Task};
pub use trigger::Trigger;
pub use worker::{WorkerOutcome, WorkerTask};
