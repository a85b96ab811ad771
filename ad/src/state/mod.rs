//! Per-agent volatile state
//!
//! The state bag lives in the relational store, partitioned by agent id and
//! mutated only by that agent's daemon. Loops read the essential subset
//! only; the full bag may be huge.

mod extract;
mod manager;

pub use extract::extract_worker_facts;
pub use manager::{EssentialState, StateManager};
