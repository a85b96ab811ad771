//! Token-bucket write limiter
//!
//! The external tracker documents a secondary write limit; one shared bucket
//! per process keeps every writer (dispatcher, workers, initiative engine)
//! under it.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket. `per_second(1)` means one write per second,
/// with a burst capacity of one.
pub struct WriteLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl WriteLimiter {
    pub fn per_second(ops: u32) -> Self {
        let capacity = ops.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available, then consume it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            debug!(?wait, "Write limiter backoff");
            sleep(wait).await;
        }
    }
}
