//! Fiber-aware synchronization primitives
//!
//! Every primitive keeps its state and FIFO waiter queues under a
//! `SpinLock`. A fiber that has to wait appends its `FiberRef`, drops the
//! spin lock, and suspends; whoever releases the resource hands it over
//! directly and wakes the waiter through its environment's inbox.
//!
//! From a carrier (plain thread, not inside a fiber) there is nothing to
//! suspend, so blocking calls fall back to retrying the `try_` variant
//! with `std::thread::yield_now` in between.

mod channel;
mod condvar;
mod mutex;
mod rwlock;
mod semaphore;

pub use channel::{channel, Channel, Receiver, Sender};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;

use crate::env::Environment;
use crate::fiber::FiberRef;

/// The running fiber, or `None` on a carrier.
#[inline]
pub(crate) fn current_waiter() -> Option<FiberRef> {
    let me = Environment::current().current_fiber();
    (!me.get().is_carrier()).then_some(me)
}

/// Retry `attempt` from a carrier until it succeeds.
#[inline]
pub(crate) fn spin_until(mut attempt: impl FnMut() -> bool) {
    while !attempt() {
        std::thread::yield_now();
    }
}
