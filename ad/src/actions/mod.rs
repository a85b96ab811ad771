//! Action dispatch
//!
//! The switch over parsed LLM actions, wrapped in bounded retries with a
//! per-agent dead-letter list and audit records for sensitive actions.

mod dispatcher;
mod retry;

pub use dispatcher::{ActionDispatcher, ActionError, DispatchStats};
pub use retry::{DEAD_LETTER_CAP, MAX_ATTEMPTS, push_dead_letter, with_backoff};
