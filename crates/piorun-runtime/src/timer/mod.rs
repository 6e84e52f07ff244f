//! Timer subsystem for piorun
//!
//! One `TimerWheel` per thread environment, sharing a `TimeoutSlab` with
//! the environment's active and timed-out lists so that an item can move
//! between the wheel, the readiness path and the run list by relinking
//! an index.
//!
//! # Architecture
//!
//! ```text
//!            epoll event (u64 = ItemKey)         clock tick
//!                      │                             │
//!                      ▼                             ▼
//!               prepare(ItemKey)          TimerWheel::take_all_timeout
//!                      │                             │
//!                      └──────────► active list ◄────┘
//!                                       │
//!                                       ▼
//!                              process: resume fiber
//! ```

mod slab;
mod wheel;

pub use slab::{ItemKey, LinkId, LinkIter, TimeoutItem, TimeoutSlab};
pub use wheel::{AddTimeoutError, TimerWheel};

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds on the runtime's monotonic clock, rounded down.
#[inline]
pub fn now_ms() -> u64 {
    Instant::now().saturating_duration_since(epoch()).as_millis() as u64
}

/// Convert a deadline to the runtime clock, rounded up, so a timeout
/// filed under it can never fire before the instant itself.
pub fn deadline_ms(deadline: Instant) -> u64 {
    let since = deadline.saturating_duration_since(epoch());
    let ms = since.as_millis() as u64;
    if since > Duration::from_millis(ms) {
        ms + 1
    } else {
        ms
    }
}

/// Deadline `d` from now on the runtime clock.
#[inline]
pub fn deadline_after(d: Duration) -> u64 {
    match Instant::now().checked_add(d) {
        Some(at) => deadline_ms(at),
        None => u64::MAX,
    }
}
