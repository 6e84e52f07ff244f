//! Condition variable paired with the fiber `Mutex`

use super::current_waiter;
use super::mutex::MutexGuard;
use crate::fiber::FiberRef;
use piorun_core::SpinLock;
use std::collections::VecDeque;

pub struct Condvar {
    waiters: SpinLock<VecDeque<FiberRef>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Release `guard`'s mutex, wait for a notification, and lock again.
    ///
    /// On a carrier the wait degenerates to unlock, yield, relock, which
    /// callers see as a spurious wakeup; use `wait_while` there.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::mutex(&guard);
        let Some(me) = current_waiter() else {
            drop(guard);
            std::thread::yield_now();
            return mutex.lock();
        };

        self.waiters.lock().push_back(me);
        drop(guard);
        me.get().suspend();
        mutex.lock()
    }

    /// Wait until `condition` no longer holds.
    pub fn wait_while<'a, T, F>(&self, mut guard: MutexGuard<'a, T>, mut condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn notify_one(&self) {
        let next = self.waiters.lock().pop_front();
        if let Some(fiber) = next {
            fiber.wake();
        }
    }

    pub fn notify_all(&self) {
        let all = std::mem::take(&mut *self.waiters.lock());
        for fiber in all {
            fiber.wake();
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run_until_idle, spawn_local};
    use crate::sync::Mutex;
    use crate::this_fiber;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_notify_one_wakes_a_single_waiter() {
        let pair = Rc::new((Mutex::new(0u32), Condvar::new()));
        let woke = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let (p, w) = (pair.clone(), woke.clone());
            spawn_local(move || {
                let (m, cv) = &*p;
                let g = cv.wait_while(m.lock(), |tickets| *tickets == 0);
                drop(g);
                w.set(w.get() + 1);
            });
        }

        let p = pair.clone();
        spawn_local(move || {
            this_fiber::yield_now();
            let (m, cv) = &*p;
            *m.lock() = 1;
            cv.notify_one();
        });

        // Run until only the second waiter is left parked
        crate::event_loop::run_until(|| woke.get() == 1 && pair.1.waiters() == 1);
        assert_eq!(woke.get(), 1);

        pair.1.notify_all();
        run_until_idle();
        assert_eq!(woke.get(), 2);
    }

    #[test]
    fn test_carrier_wait_while_sees_other_thread() {
        let pair = std::sync::Arc::new((Mutex::new(false), Condvar::new()));
        let p = pair.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            *p.0.lock() = true;
            p.1.notify_all();
        });
        let g = pair.1.wait_while(pair.0.lock(), |ready| !*ready);
        assert!(*g);
        drop(g);
        t.join().unwrap();
    }
}
