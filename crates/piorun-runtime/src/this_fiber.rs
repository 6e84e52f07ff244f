//! Operations on the calling fiber
//!
//! Every function works from plain threads too: there the "current
//! fiber" is the carrier, and blocking falls back to the OS.

use crate::env::{worker_binding, Environment};
use crate::fiber::FiberRef;
use crate::reactor::Pending;
use crate::timer::{deadline_after, deadline_ms, now_ms, AddTimeoutError, TimeoutItem};
use piorun_core::{kwarn, FiberId};
use std::time::{Duration, Instant};

/// Handle to the running fiber (the carrier outside any fiber).
#[inline]
pub fn current() -> FiberRef {
    Environment::current().current_fiber()
}

#[inline]
pub fn get_id() -> FiberId {
    current().id()
}

/// Index of the worker thread we run on, or `None` off the pool.
#[inline]
pub fn get_thread_id() -> Option<usize> {
    worker_binding().map(|(_, idx)| idx)
}

/// Let the other ready fibers of this thread run.
pub fn yield_now() {
    let env = Environment::current();
    let me = env.current_fiber();
    if me.get().is_carrier() {
        std::thread::yield_now();
        return;
    }
    env.push_yielded(me);
    me.get().suspend();
}

pub fn sleep_for(d: Duration) {
    let env = Environment::current();
    if env.current_fiber().get().is_carrier() {
        std::thread::sleep(d);
        return;
    }
    sleep_until_ms(env, deadline_after(d));
}

pub fn sleep_until(deadline: Instant) {
    let env = Environment::current();
    if env.current_fiber().get().is_carrier() {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        return;
    }
    if deadline <= Instant::now() {
        return;
    }
    sleep_until_ms(env, deadline_ms(deadline));
}

fn sleep_until_ms(env: &Environment, expire: u64) {
    let me = env.current_fiber();
    let now = now_ms();
    let filed = env.with_reactor(|reactor| {
        reactor.schedule_timeout(TimeoutItem::new(expire, Pending::Wake(me)), now)
    });
    match filed {
        Ok(key) => {
            me.get().suspend();
            env.with_reactor(|reactor| reactor.slab.remove(key));
        }
        Err(AddTimeoutError::AlreadyExpired { .. }) => {}
        Err(e) => kwarn!("fiber {} could not sleep: {}", me.id(), e),
    }
}

/// Route blocking socket calls of the current fiber through the reactor.
pub fn enable_system_hook() {
    current().get().enable_hook();
}

pub fn disable_system_hook() {
    current().get().disable_hook();
}

/// Whether hooked calls made right now would suspend instead of block.
pub fn is_hook_enabled() -> bool {
    let me = current();
    !me.get().is_carrier() && me.get().hook_enabled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run_until_idle, spawn_local};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_carrier_fallbacks() {
        assert!(current().get().is_carrier());
        assert_eq!(get_thread_id(), None);
        let start = Instant::now();
        sleep_for(Duration::from_millis(5));
        assert!(start.elapsed() >= Duration::from_millis(5));
        sleep_until(Instant::now() - Duration::from_millis(1));
        yield_now();
        assert!(!is_hook_enabled());
    }

    #[test]
    fn test_ids_differ_per_fiber() {
        let carrier = get_id();
        let seen = Rc::new(Cell::new(FiberId::NONE));
        let s = seen.clone();
        spawn_local(move || s.set(get_id()));
        run_until_idle();
        assert!(!seen.get().is_none());
        assert_ne!(seen.get(), carrier);
    }

    #[test]
    fn test_sleep_until_past_deadline_returns_at_once() {
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        spawn_local(move || {
            sleep_until(Instant::now() - Duration::from_secs(1));
            d.set(true);
        });
        // One tick runs the task to completion without any timer
        crate::event_loop::run_once(Environment::current(), None);
        assert!(done.get());
    }

    #[test]
    fn test_hook_toggle_is_per_fiber() {
        let states = Rc::new(Cell::new((false, false)));
        let s = states.clone();
        spawn_local(move || {
            enable_system_hook();
            let on = is_hook_enabled();
            disable_system_hook();
            s.set((on, is_hook_enabled()));
        });
        run_until_idle();
        assert_eq!(states.get(), (true, false));
    }
}
