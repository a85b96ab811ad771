//! Scheduled trigger source
//!
//! The ticker fires the `scheduled` trigger every `LOOP_INTERVAL` seconds.
//! For external schedulers the same interval is also expressed as a cron
//! line via [`cron_expr`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::Trigger;

use super::LoopRequest;

/// Map a loop interval to the cron expression registered with external
/// schedulers:
/// up to a minute -> every minute; up to an hour -> every n/60 minutes;
/// up to a day -> every n/3600 hours; beyond that -> daily at midnight.
pub fn cron_expr(interval_secs: u64) -> String {
    if interval_secs <= 60 {
        "* * * * *".to_string()
    } else if interval_secs <= 3600 {
        format!("*/{} * * * *", interval_secs / 60)
    } else if interval_secs <= 86_400 {
        format!("0 */{} * * *", interval_secs / 3600)
    } else {
        "0 0 * * *".to_string()
    }
}

/// Spawn the recurring trigger. The first tick fires one full interval
/// after start; startup work has its own triggers.
pub fn spawn_ticker(tx: mpsc::Sender<LoopRequest>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(interval_secs.max(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            debug!("Scheduled tick");
            if tx
                .send(LoopRequest {
                    trigger: Trigger::Scheduled,
                    message: None,
                })
                .await
                .is_err()
            {
                // Daemon shut down
                return;
            }
        }
    })
}
