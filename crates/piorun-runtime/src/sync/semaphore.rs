//! Counting semaphore
//!
//! `signal` passes its permit straight to the first waiter when there is
//! one, so permits are granted in FIFO order.

use super::{current_waiter, spin_until};
use crate::fiber::FiberRef;
use piorun_core::SpinLock;
use std::collections::VecDeque;

struct State {
    permits: usize,
    waiters: VecDeque<FiberRef>,
}

pub struct Semaphore {
    state: SpinLock<State>,
}

impl Semaphore {
    pub const fn new(permits: usize) -> Self {
        Self {
            state: SpinLock::new(State {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take a permit, suspending the calling fiber until one is free.
    pub fn wait(&self) {
        let Some(me) = current_waiter() else {
            spin_until(|| self.try_wait());
            return;
        };
        {
            let mut s = self.state.lock();
            if s.permits > 0 {
                s.permits -= 1;
                return;
            }
            s.waiters.push_back(me);
        }
        me.get().suspend();
    }

    pub fn try_wait(&self) -> bool {
        let mut s = self.state.lock();
        if s.permits > 0 {
            s.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Return a permit.
    pub fn signal(&self) {
        let next = {
            let mut s = self.state.lock();
            let next = s.waiters.pop_front();
            if next.is_none() {
                s.permits += 1;
            }
            next
        };
        if let Some(fiber) = next {
            fiber.wake();
        }
    }

    /// Permits that can be taken without waiting
    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run_until_idle, spawn_local};
    use crate::this_fiber;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_counting() {
        let sem = Semaphore::new(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.signal();
        assert_eq!(sem.available(), 1);
        sem.wait();
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_permits_granted_fifo() {
        let sem = Rc::new(Semaphore::new(0));
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let (s, o) = (sem.clone(), order.clone());
            spawn_local(move || {
                s.wait();
                o.borrow_mut().push(i);
            });
        }
        let s = sem.clone();
        spawn_local(move || {
            this_fiber::yield_now();
            assert_eq!(s.waiters(), 3);
            for _ in 0..3 {
                s.signal();
            }
        });
        run_until_idle();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(sem.available(), 0);
    }
}
