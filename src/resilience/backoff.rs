//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Delay before retry number `attempt`, in whole seconds.
///
/// The delay is drawn uniformly from `1..=min(cap_secs, 2^attempt)` so that
/// workers retrying the same failed cache spread out. Attempt 0 means no wait.
pub fn retry_delay(attempt: u32, cap_secs: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let upper = exponential.min(cap_secs).max(1);

    Duration::from_secs(rand::thread_rng().gen_range(1..=upper))
}
