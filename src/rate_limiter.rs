//! Minimum-spacing rate limiter for outbound upstream calls.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Floor applied to non-positive or non-finite rates.
const MIN_RATE_PER_SEC: f64 = 1.0;

/// Grants one acquisition per `1/rate` seconds.
///
/// Each caller reserves the next free slot under the lock and then sleeps
/// outside of it, so concurrent acquirers get strictly increasing slots in
/// lock order and never burst past one call per interval.
pub struct RateLimiter {
    interval: Duration,
    /// Slot granted to the previous acquirer. `None` until the first call.
    last_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            MIN_RATE_PER_SEC
        };
        Self {
            interval: Duration::from_secs_f64(1.0 / rate),
            last_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until this caller's slot arrives.
    pub async fn acquire(&self) {
        let slot = {
            let mut last = self.last_slot.lock().await;
            let now = Instant::now();
            let slot = match *last {
                Some(prev) => (prev + self.interval).max(now),
                None => now,
            };
            *last = Some(slot);
            slot
        };

        if slot > Instant::now() {
            debug!(wait_ms = (slot - Instant::now()).as_millis() as u64, "Rate limiter: waiting for slot");
            sleep_until(slot).await;
        }
    }
}
