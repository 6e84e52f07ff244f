//! Per-thread run environment
//!
//! Every OS thread that touches the runtime gets exactly one
//! `Environment`, created lazily through a `thread_local!` and torn down
//! at thread exit. It owns everything fibers of that thread share:
//!
//! - the carrier fiber (the thread's own stack) and the call stack
//! - the `Reactor`: epoll, the timeout arena and the timer wheel
//! - the fiber pool used to run tasks
//! - local task and user-yield queues
//! - the inbox, the one structure other threads may write to
//!
//! Apart from the inbox and the stats, all state sits in `UnsafeCell`s
//! and is only reached from the owning thread. No borrow of it is held
//! across a context switch.

use crate::config::{self, RuntimeConfig};
use crate::fiber::{Callback, Fiber, FiberRef};
use crate::reactor::Reactor;
use piorun_core::error::{SchedError, SchedResult};
use piorun_core::{kerror, ktrace, SpinLock};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A unit of work submitted to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cross-thread wake queue of one environment.
pub struct Inbox {
    queue: SpinLock<VecDeque<FiberRef>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn push(&self, fiber: FiberRef) {
        self.queue.lock().push_back(fiber);
    }

    /// Swap out everything posted so far.
    pub fn take(&self) -> VecDeque<FiberRef> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of one environment, readable from any thread.
#[derive(Debug, Default)]
pub struct EnvStats {
    live_fibers: AtomicUsize,
    tasks_run: AtomicU64,
}

impl EnvStats {
    #[inline]
    pub(crate) fn fiber_started(&self) {
        self.live_fibers.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn fiber_ended(&self) {
        self.live_fibers.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn task_started(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Fibers that started and have not ended yet
    #[inline]
    pub fn live_fibers(&self) -> usize {
        self.live_fibers.load(Ordering::Acquire)
    }

    /// Tasks handed to a pool fiber so far
    #[inline]
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.load(Ordering::Relaxed)
    }
}

thread_local! {
    static ENV: Environment = match Environment::new() {
        Ok(env) => env,
        Err(e) => {
            kerror!("failed to set up thread environment: {}", e);
            panic!("failed to set up thread environment: {}", e);
        }
    };

    // (scheduler id, worker index); kept apart from ENV so that asking
    // does not build an environment
    static WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };

    // Config for the environment this thread has not built yet
    static PENDING_CONFIG: RefCell<Option<Arc<RuntimeConfig>>> = const { RefCell::new(None) };
}

/// Use `config` instead of the process-wide one for this thread's
/// environment. Only has an effect before the environment is first
/// touched; scheduler workers call it on entry.
pub(crate) fn configure_thread(config: Arc<RuntimeConfig>) {
    PENDING_CONFIG.with(|pending| *pending.borrow_mut() = Some(config));
}

/// The (scheduler id, worker index) this thread serves, if any.
#[inline]
pub fn worker_binding() -> Option<(u64, usize)> {
    WORKER.with(|w| w.get())
}

pub(crate) fn set_worker_binding(binding: Option<(u64, usize)>) {
    WORKER.with(|w| w.set(binding));
    piorun_core::kprint::set_worker_id(binding.map(|(_, idx)| idx));
}

pub struct Environment {
    config: Arc<RuntimeConfig>,
    carrier: NonNull<Fiber>,
    call_stack: UnsafeCell<Vec<FiberRef>>,
    reactor: UnsafeCell<Reactor>,

    pool: UnsafeCell<Vec<FiberRef>>,
    allocated: UnsafeCell<Vec<NonNull<Fiber>>>,

    local_tasks: UnsafeCell<VecDeque<Callback>>,
    yielded: UnsafeCell<VecDeque<FiberRef>>,

    inbox: Arc<Inbox>,
    stats: Arc<EnvStats>,
}

impl Environment {
    fn new() -> SchedResult<Self> {
        let config = PENDING_CONFIG
            .with(|pending| pending.borrow_mut().take())
            .unwrap_or_else(|| Arc::new(config::current().clone()));
        let inbox = Arc::new(Inbox::new());
        let reactor = Reactor::new(config.epoll_events, config.wheel_slots)?;

        let carrier = NonNull::from(Box::leak(Box::new(Fiber::carrier(inbox.clone()))));
        let mut call_stack = Vec::with_capacity(config.call_stack_depth);
        // Safety: just leaked, freed only in Drop
        call_stack.push(unsafe { carrier.as_ref() }.handle());

        Ok(Self {
            config,
            carrier,
            call_stack: UnsafeCell::new(call_stack),
            reactor: UnsafeCell::new(reactor),
            pool: UnsafeCell::new(Vec::new()),
            allocated: UnsafeCell::new(Vec::new()),
            local_tasks: UnsafeCell::new(VecDeque::new()),
            yielded: UnsafeCell::new(VecDeque::new()),
            inbox,
            stats: Arc::new(EnvStats::default()),
        })
    }

    /// This thread's environment, created on first use.
    ///
    /// The reference stays valid until the thread starts running its
    /// thread-local destructors.
    pub fn current() -> &'static Environment {
        // Safety: the thread-local lives until thread exit and is never
        // moved once initialised
        ENV.with(|env| unsafe { &*(env as *const Environment) })
    }

    /// Like `current`, but `None` once the environment is being torn down.
    pub fn try_current() -> Option<&'static Environment> {
        ENV.try_with(|env| unsafe { &*(env as *const Environment) }).ok()
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    #[inline]
    pub fn stats(&self) -> &Arc<EnvStats> {
        &self.stats
    }

    #[inline]
    pub fn live_fibers(&self) -> usize {
        self.stats.live_fibers()
    }

    // ---- call stack -------------------------------------------------

    /// The fiber at the top of the call stack.
    #[inline]
    pub fn current_fiber(&self) -> FiberRef {
        let stack = unsafe { &*self.call_stack.get() };
        match stack.last() {
            Some(top) => *top,
            None => unsafe { self.carrier.as_ref() }.handle(),
        }
    }

    /// Call-stack depth; 1 while only the carrier is running.
    #[inline]
    pub fn depth(&self) -> usize {
        unsafe { (*self.call_stack.get()).len() }
    }

    #[inline]
    pub fn in_fiber(&self) -> bool {
        self.depth() > 1
    }

    pub(crate) fn push_fiber(&self, fiber: FiberRef) {
        let stack = unsafe { &mut *self.call_stack.get() };
        assert!(
            stack.len() < self.config.call_stack_depth,
            "fiber call stack overflow (depth {})",
            self.config.call_stack_depth
        );
        fiber.get().set_on_stack(true);
        stack.push(fiber);
    }

    pub(crate) fn pop_fiber(&self) {
        let stack = unsafe { &mut *self.call_stack.get() };
        assert!(stack.len() > 1, "attempt to pop the carrier fiber");
        if let Some(fiber) = stack.pop() {
            fiber.get().set_on_stack(false);
        }
    }

    // ---- reactor ----------------------------------------------------

    /// Run `f` with exclusive access to the reactor.
    ///
    /// `f` must not switch fibers.
    #[inline]
    pub(crate) fn with_reactor<R>(&self, f: impl FnOnce(&mut Reactor) -> R) -> R {
        f(unsafe { &mut *self.reactor.get() })
    }

    /// Wait for readiness up to `timeout_ms` and route the harvested
    /// events into the active list. Returns the number of events.
    pub fn epoll_wait(&self, timeout_ms: i32) -> usize {
        self.with_reactor(|reactor| {
            let n = reactor.poller.wait(timeout_ms);
            reactor.dispatch_events(n);
            n
        })
    }

    /// Sleeps and polls registered in this environment.
    pub fn pending_waits(&self) -> usize {
        self.with_reactor(|reactor| reactor.outstanding())
    }

    // ---- pool -------------------------------------------------------

    /// An idle pool fiber, allocating a new batch when the pool is dry.
    pub fn get_fiber_from_pool(&self) -> SchedResult<FiberRef> {
        if unsafe { (*self.pool.get()).is_empty() } {
            self.grow_pool()?;
        }
        unsafe { (*self.pool.get()).pop() }.ok_or(SchedError::InvalidState)
    }

    fn grow_pool(&self) -> SchedResult<()> {
        let batch = self.config.pool_batch.max(1);
        for _ in 0..batch {
            let fiber: &'static Fiber = Box::leak(Box::new(Fiber::with_stack(self, true)?));
            unsafe {
                (*self.allocated.get()).push(NonNull::from(fiber));
                (*self.pool.get()).push(fiber.handle());
            }
        }
        ktrace!(
            "fiber pool grew by {} (total {})",
            batch,
            self.pool_allocated()
        );
        Ok(())
    }

    /// Return an ended pool fiber to the free list.
    pub fn recycle_fiber_to_pool(&self, fiber: FiberRef) {
        if fiber.get().is_pool_owned() {
            unsafe { (*self.pool.get()).push(fiber) };
        }
    }

    /// Idle fibers currently in the pool
    pub fn pool_idle(&self) -> usize {
        unsafe { (*self.pool.get()).len() }
    }

    /// Pool fibers ever allocated by this environment
    pub fn pool_allocated(&self) -> usize {
        unsafe { (*self.allocated.get()).len() }
    }

    // ---- queues -----------------------------------------------------

    /// Queue a callback to run on a pool fiber during the next tick.
    pub fn push_local(&self, task: Callback) {
        unsafe { (*self.local_tasks.get()).push_back(task) };
    }

    pub(crate) fn take_local(&self) -> VecDeque<Callback> {
        unsafe { std::mem::take(&mut *self.local_tasks.get()) }
    }

    pub(crate) fn push_yielded(&self, fiber: FiberRef) {
        unsafe { (*self.yielded.get()).push_back(fiber) };
    }

    pub(crate) fn take_yielded(&self) -> VecDeque<FiberRef> {
        unsafe { std::mem::take(&mut *self.yielded.get()) }
    }

    /// Post `fiber` for resumption; callable from any thread through the
    /// fiber's own handle (`FiberRef::wake`).
    #[inline]
    pub fn post(&self, fiber: FiberRef) {
        self.inbox.push(fiber);
    }

    /// Anything runnable without waiting for I/O or time.
    pub fn has_ready_work(&self) -> bool {
        let queued = unsafe {
            !(*self.local_tasks.get()).is_empty() || !(*self.yielded.get()).is_empty()
        };
        queued || !self.inbox.is_empty()
    }

    /// No live fibers, nothing queued and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.live_fibers() == 0 && !self.has_ready_work() && self.pending_waits() == 0
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        for fiber in std::mem::take(self.allocated.get_mut()) {
            drop(unsafe { Box::from_raw(fiber.as_ptr()) });
        }
        self.call_stack.get_mut().clear();
        drop(unsafe { Box::from_raw(self.carrier.as_ptr()) });
    }
}
