//! Initiative engine
//!
//! Proactive work generation for idle agents: score the bootstrap backlog
//! against the agent's focus area, guard against duplicates, and fall back
//! to AI-driven generation when the backlog runs dry.

mod dedupe;
mod engine;
mod scoring;

pub use dedupe::{is_duplicate, jaccard, normalize_title};
pub use engine::{InitiativeEngine, InitiativeOutcome};
pub use scoring::score;
