//! The per-thread event loop
//!
//! One `run_once` call is one tick:
//!
//! 1. `epoll_wait`, routing readiness into the active list
//! 2. steal a batch from the scheduler's shared queue (if attached)
//! 3. harvest the timer wheel into the active list
//! 4. resume every fiber whose wait completed
//! 5. run stolen and local tasks on pool fibers
//! 6. resume fibers that yielded during the previous tick
//! 7. resume fibers posted to the inbox
//!
//! Fibers resumed here run until they suspend again, so a tick never
//! blocks longer than the poll timeout plus the time fibers spend running.

use crate::env::{Environment, Task};
use crate::fiber::{Callback, FiberRef};
use crate::timer::now_ms;
use crossbeam_queue::SegQueue;
use piorun_core::kerror;

/// Run one tick on `env`. Returns how many fibers and tasks it ran.
pub fn run_once(env: &Environment, shared: Option<&SegQueue<Task>>) -> usize {
    let config = env.config();

    let busy = env.has_ready_work() || shared.is_some_and(|q| !q.is_empty());
    let timeout = if busy { 0 } else { config.poll_timeout_ms() };
    env.epoll_wait(timeout);

    let mut stolen: Vec<Task> = Vec::new();
    if let Some(queue) = shared {
        while stolen.len() < config.task_batch.max(1) {
            match queue.pop() {
                Some(task) => stolen.push(task),
                None => break,
            }
        }
    }

    let mut ready: Vec<FiberRef> = Vec::new();
    let now = now_ms();
    env.with_reactor(|reactor| reactor.collect_due(now, &mut ready));
    let mut work = ready.len();
    for fiber in ready {
        fiber.get().resume();
    }

    let local = env.take_local();
    work += stolen.len() + local.len();
    for task in stolen.into_iter().map(|t| t as Callback).chain(local) {
        run_task(env, task);
    }

    let yielded = env.take_yielded();
    work += yielded.len();
    for fiber in yielded {
        fiber.get().resume();
    }

    let signaled = env.inbox().take();
    work += signaled.len();
    for fiber in signaled {
        fiber.get().resume();
    }

    work
}

/// Run `task` on a fiber from the pool.
fn run_task(env: &Environment, task: Callback) {
    let fiber = match env.get_fiber_from_pool() {
        Ok(fiber) => fiber,
        Err(e) => {
            kerror!("no fiber available to run task: {}", e);
            return;
        }
    };
    match fiber.get().reset_boxed(task) {
        Ok(()) => {
            env.stats().task_started();
            fiber.get().resume();
        }
        Err(e) => {
            kerror!("pool fiber {} not reusable: {}", fiber.id(), e);
        }
    }
}

/// Queue `f` to run on a pool fiber of this thread.
///
/// Nothing runs until this thread drives its loop (`run_until`,
/// `run_until_idle`, or being a scheduler worker).
pub fn spawn_local<F>(f: F)
where
    F: FnOnce() + 'static,
{
    Environment::current().push_local(Box::new(f));
}

/// Tick this thread's loop until `pred` holds.
///
/// # Panics
///
/// When called from inside a fiber.
pub fn run_until<P>(mut pred: P)
where
    P: FnMut() -> bool,
{
    let env = Environment::current();
    assert!(!env.in_fiber(), "run_until called from inside a fiber");
    while !pred() {
        run_once(env, None);
    }
}

/// Tick this thread's loop until it has nothing left to do.
pub fn run_until_idle() {
    let env = Environment::current();
    run_until(|| env.is_idle());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::this_fiber;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_local_tasks_run_to_completion() {
        let hits = Rc::new(Cell::new(0));
        for _ in 0..10 {
            let hits = hits.clone();
            spawn_local(move || hits.set(hits.get() + 1));
        }
        run_until_idle();
        assert_eq!(hits.get(), 10);
        assert_eq!(Environment::current().live_fibers(), 0);
    }

    #[test]
    fn test_shared_queue_is_drained_in_batches() {
        let env = Environment::current();
        let queue = SegQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let total = env.config().task_batch.max(1) + 5;
        for _ in 0..total {
            let hits = hits.clone();
            queue.push(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }) as Task);
        }
        run_once(env, Some(&queue));
        assert_eq!(hits.load(Ordering::SeqCst), total - 5);
        run_once(env, Some(&queue));
        assert_eq!(hits.load(Ordering::SeqCst), total);
    }

    #[test]
    fn test_yield_interleaves_fibers() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        for name in ['a', 'b'] {
            let trace = trace.clone();
            spawn_local(move || {
                for i in 0..3 {
                    trace.borrow_mut().push((name, i));
                    this_fiber::yield_now();
                }
            });
        }
        run_until_idle();
        assert_eq!(
            *trace.borrow(),
            vec![('a', 0), ('b', 0), ('a', 1), ('b', 1), ('a', 2), ('b', 2)]
        );
    }

    #[test]
    fn test_sleep_accuracy() {
        let elapsed = Rc::new(Cell::new(Duration::ZERO));
        let e = elapsed.clone();
        spawn_local(move || {
            let start = Instant::now();
            this_fiber::sleep_for(Duration::from_millis(50));
            e.set(start.elapsed());
        });
        run_until_idle();
        let took = elapsed.get();
        assert!(took >= Duration::from_millis(50), "woke early: {:?}", took);
        assert!(took < Duration::from_millis(50 + 40), "woke late: {:?}", took);
    }

    #[test]
    fn test_sleepers_wake_in_deadline_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            spawn_local(move || {
                this_fiber::sleep_for(Duration::from_millis(ms));
                order.borrow_mut().push(ms);
            });
        }
        run_until_idle();
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn test_run_until_predicate() {
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        spawn_local(move || {
            this_fiber::sleep_for(Duration::from_millis(5));
            d.set(true);
        });
        run_until(|| done.get());
        assert!(done.get());
    }
}
