//! Bounded exponential backoff for store writes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::Result;

/// Delay before retry number `attempt` (1-based: the wait after the first
/// failure is `delay_for(1)`). Doubles per attempt, capped at `max_delay`.
pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let raw = policy.base_delay.saturating_mul(1u32 << exp);
    let capped = raw.min(policy.max_delay);

    if policy.jitter && !capped.is_zero() {
        // Up to +25%, still capped.
        let extra = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
        (capped + Duration::from_millis(extra)).min(policy.max_delay.max(capped))
    } else {
        capped
    }
}

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is spent.
/// Only transient failures are retried. Returns the value or the last error,
/// together with the number of attempts made.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> (Result<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = delay_for(policy, attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
