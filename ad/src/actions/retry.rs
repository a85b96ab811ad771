//! Retry wrapper and dead-letter list

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use msgfabric::{Broker, channels};
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::Action;

use super::dispatcher::ActionError;

/// Attempts per action before dead-lettering
pub const MAX_ATTEMPTS: u32 = 3;

/// Dead-letter entries retained per agent
pub const DEAD_LETTER_CAP: usize = 100;

/// Run an operation up to [`MAX_ATTEMPTS`] times with exponential backoff
/// (1 s, 2 s, ...). Permanent errors abort immediately.
pub async fn with_backoff<F, Fut>(label: &str, mut op: F) -> Result<(), ActionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ActionError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(()) => {
                debug!(label, attempt, "Action succeeded");
                return Ok(());
            }
            Err(e) if e.is_permanent() => {
                warn!(label, attempt, error = %e, "Permanent action failure");
                return Err(e);
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                let backoff = Duration::from_secs(1 << (attempt - 1));
                warn!(label, attempt, error = %e, ?backoff, "Action failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(label, attempt, error = %e, "Action failed after final attempt");
                return Err(e);
            }
        }
    }
}

/// Push an exhausted action onto the agent's dead-letter list, capped at
/// [`DEAD_LETTER_CAP`] (oldest entries fall off first)
pub async fn push_dead_letter(broker: &Arc<dyn Broker>, agent_type: &str, action: &Action, error: &ActionError) {
    let key = channels::dead_letter_key(agent_type);
    let entry = json!({
        "action": action,
        "error": error.to_string(),
        "failedAt": Utc::now().to_rfc3339(),
    })
    .to_string();

    if let Err(e) = broker.list_push_back(&key, vec![entry]).await {
        warn!(error = %e, "Failed to record dead letter");
        return;
    }
    if let Err(e) = broker.list_trim(&key, DEAD_LETTER_CAP).await {
        warn!(error = %e, "Failed to trim dead-letter list");
    }
}
