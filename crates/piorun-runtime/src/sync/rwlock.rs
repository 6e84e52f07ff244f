//! Reader-writer lock with writer priority
//!
//! `state` is `0` when free, `-1` while a writer holds it and the reader
//! count otherwise. New readers queue as soon as a writer waits, and a
//! writer release prefers the next writer over the waiting readers.

use super::{current_waiter, spin_until};
use crate::fiber::FiberRef;
use piorun_core::SpinLock;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

struct State {
    state: isize,
    readers: VecDeque<FiberRef>,
    writers: VecDeque<FiberRef>,
}

pub struct RwLock<T> {
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

// Safety: guards enforce many-readers or one-writer
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(State {
                state: 0,
                readers: VecDeque::new(),
                writers: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let Some(me) = current_waiter() else {
            spin_until(|| self.try_lock_shared());
            return RwLockReadGuard { lock: self };
        };
        {
            let mut s = self.state.lock();
            if s.state >= 0 && s.writers.is_empty() {
                s.state += 1;
                return RwLockReadGuard { lock: self };
            }
            s.readers.push_back(me);
        }
        me.get().suspend();
        RwLockReadGuard { lock: self }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let Some(me) = current_waiter() else {
            spin_until(|| self.try_lock_exclusive());
            return RwLockWriteGuard { lock: self };
        };
        {
            let mut s = self.state.lock();
            if s.state == 0 {
                s.state = -1;
                return RwLockWriteGuard { lock: self };
            }
            s.writers.push_back(me);
        }
        me.get().suspend();
        RwLockWriteGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.try_lock_shared().then(|| RwLockReadGuard { lock: self })
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.try_lock_exclusive().then(|| RwLockWriteGuard { lock: self })
    }

    fn try_lock_shared(&self) -> bool {
        let mut s = self.state.lock();
        if s.state >= 0 && s.writers.is_empty() {
            s.state += 1;
            true
        } else {
            false
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        let mut s = self.state.lock();
        if s.state == 0 {
            s.state = -1;
            true
        } else {
            false
        }
    }

    fn unlock_shared(&self) {
        let next = {
            let mut s = self.state.lock();
            s.state -= 1;
            if s.state == 0 {
                let next = s.writers.pop_front();
                if next.is_some() {
                    s.state = -1;
                }
                next
            } else {
                None
            }
        };
        if let Some(writer) = next {
            writer.wake();
        }
    }

    fn unlock_exclusive(&self) {
        let woken: Vec<FiberRef> = {
            let mut s = self.state.lock();
            if let Some(writer) = s.writers.pop_front() {
                s.state = -1;
                vec![writer]
            } else if !s.readers.is_empty() {
                s.state = s.readers.len() as isize;
                s.readers.drain(..).collect()
            } else {
                s.state = 0;
                Vec::new()
            }
        };
        for fiber in woken {
            fiber.wake();
        }
    }

    /// Raw lock word: `0` free, `-1` writer, `n > 0` readers.
    pub fn lock_state(&self) -> isize {
        self.state.lock().state
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
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
    fn test_try_variants() {
        let lock = RwLock::new(5);
        let r1 = lock.try_read().unwrap();
        let r2 = lock.try_read().unwrap();
        assert_eq!(lock.lock_state(), 2);
        assert!(lock.try_write().is_none());
        drop((r1, r2));
        let w = lock.try_write().unwrap();
        assert_eq!(lock.lock_state(), -1);
        assert!(lock.try_read().is_none());
        drop(w);
        assert_eq!(lock.lock_state(), 0);
    }

    #[test]
    fn test_writer_priority_handoff() {
        let lock = Rc::new(RwLock::new(0));
        let log = Rc::new(RefCell::new(Vec::new()));

        // Reader holds the lock for two ticks
        let (l, g) = (lock.clone(), log.clone());
        spawn_local(move || {
            let r = l.read();
            this_fiber::yield_now();
            this_fiber::yield_now();
            g.borrow_mut().push(format!("r0 saw {}", *r));
        });
        // Writer queues behind the reader
        let (l, g) = (lock.clone(), log.clone());
        spawn_local(move || {
            let mut w = l.write();
            *w += 1;
            g.borrow_mut().push("w1".to_string());
        });
        // A late reader must wait for the queued writer
        let (l, g) = (lock.clone(), log.clone());
        spawn_local(move || {
            let r = l.read();
            g.borrow_mut().push(format!("r2 saw {}", *r));
        });
        run_until_idle();

        assert_eq!(
            *log.borrow(),
            vec!["r0 saw 0".to_string(), "w1".to_string(), "r2 saw 1".to_string()]
        );
        assert_eq!(lock.lock_state(), 0);
    }

    #[test]
    fn test_writer_release_wakes_all_readers() {
        let lock = Rc::new(RwLock::new(()));
        let peak = Rc::new(RefCell::new(0isize));

        let l = lock.clone();
        spawn_local(move || {
            let _w = l.write();
            this_fiber::yield_now();
        });
        for _ in 0..3 {
            let (l, p) = (lock.clone(), peak.clone());
            spawn_local(move || {
                let _r = l.read();
                let now = l.lock_state();
                let mut p = p.borrow_mut();
                *p = (*p).max(now);
            });
        }
        run_until_idle();
        assert_eq!(*peak.borrow(), 3);
    }
}
