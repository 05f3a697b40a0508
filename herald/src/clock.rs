//! Monotonic uptime clock used for every due time in the crate.
//!
//! Due times are plain `u64` milliseconds since a process-wide epoch that is
//! captured the first time the clock is read. A due time of `0` is reserved
//! and means "immediate, ahead of everything already queued".

use std::time::{Duration, Instant};

use lazy_static::lazy_static;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Milliseconds elapsed on the monotonic clock since the process epoch.
/// Starts at 1 so a computed deadline never collides with the reserved `0`.
pub fn uptime_millis() -> u64 {
    let elapsed = EPOCH.elapsed().as_millis();
    u64::try_from(elapsed).unwrap_or(u64::MAX).saturating_add(1)
}

/// Absolute due time `delay` from now, saturating instead of overflowing.
pub fn deadline_after(delay: Duration) -> u64 {
    let delay = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    uptime_millis().saturating_add(delay)
}
