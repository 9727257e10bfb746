//! Process-wide monotonic clock.
//!
//! The poll loop, the clap queue, and the host-visible timestamps all read
//! the same clock so that "seconds since start" and "nanoseconds since
//! start" agree. The epoch is pinned the first time any reader asks, which
//! happens during driver initialization.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// The granularity the OS sleep can be trusted to honor. Sub-period waits
/// are busy-waited by the callers.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Seconds elapsed since the process clock epoch.
pub fn seconds() -> f64 {
    epoch().elapsed().as_secs_f64()
}

/// Nanoseconds elapsed since the process clock epoch.
pub fn nanos() -> u64 {
    u64::try_from(epoch().elapsed().as_nanos()).unwrap_or(u64::MAX)
}
