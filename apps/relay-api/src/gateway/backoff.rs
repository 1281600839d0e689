//! Bounded exponential backoff with jitter for store/bus retries.

use std::time::Duration;

use rand::Rng;

/// First retry delay after a failure.
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Delay before retry number `failures` (1-based): 1s, 2s, 4s, ... capped at
/// `cap`, plus up to 25% random jitter (the total never exceeds `cap`).
pub fn backoff_delay(failures: u32, cap: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = BASE_DELAY.saturating_mul(1u32 << exponent).min(cap);
    let jitter_ms = (base.as_millis() as u64) / 4;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    (base + jitter).min(cap)
}
