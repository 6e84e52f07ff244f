//! Fiber-aware mutex
//!
//! Unlike `std::sync::Mutex`, a contended `lock` suspends the calling
//! fiber instead of blocking its OS thread. Unlock hands ownership to the
//! longest waiter, so acquisition order is FIFO.

use super::{current_waiter, spin_until};
use crate::fiber::FiberRef;
use piorun_core::SpinLock;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};

struct State {
    locked: bool,
    waiters: VecDeque<FiberRef>,
}

/// A mutex without data: `lock`/`unlock` in any pairing the caller likes.
pub struct RawMutex {
    state: SpinLock<State>,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn lock(&self) {
        let Some(me) = current_waiter() else {
            spin_until(|| self.try_lock());
            return;
        };
        {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return;
            }
            state.waiters.push_back(me);
        }
        // Woken only by `unlock`, which leaves the mutex locked for us
        me.get().suspend();
    }

    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Release the mutex, or pass it straight to the first waiter.
    pub fn unlock(&self) {
        let next = {
            let mut state = self.state.lock();
            let next = state.waiters.pop_front();
            if next.is_none() {
                state.locked = false;
            }
            next
        };
        if let Some(fiber) = next {
            fiber.wake();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Fibers parked in `lock`
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: `data` is only reached through a guard, and at most one exists
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire, suspending the calling fiber while contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_lock().then(|| MutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard locks.
    pub fn mutex(guard: &Self) -> &'a Mutex<T> {
        guard.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}
