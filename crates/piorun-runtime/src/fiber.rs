//! Stackful fibers
//!
//! A `Fiber` is an `ExecutionContext` with a private stack, a one-shot
//! callback and a handful of lifecycle flags. Fibers run only on the
//! thread whose `Environment` created them; `resume` pushes the fiber on
//! that environment's call stack and `suspend` pops it again.
//!
//! ```text
//!   carrier ──resume──► fiber A ──resume──► fiber B
//!      ▲                   ▲                   │
//!      │                   └─────suspend───────┘
//!      └──────suspend──────┘
//! ```
//!
//! Other threads only ever see a `FiberRef`, and the only thing they may
//! do with one is `wake` it: post it into its owner's inbox.

use crate::context::ExecutionContext;
use crate::env::{Environment, Inbox};
use piorun_core::error::{SchedError, SchedResult};
use piorun_core::{kerror, FiberId, FiberState};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

pub(crate) type Callback = Box<dyn FnOnce() + 'static>;

pub struct Fiber {
    ctx: UnsafeCell<ExecutionContext>,
    callback: Cell<Option<Callback>>,
    id: FiberId,

    started: Cell<bool>,
    ended: Cell<bool>,
    on_stack: Cell<bool>,
    panicked: Cell<bool>,
    hook: Cell<bool>,

    carrier: bool,
    pool_owned: bool,
    hook_default: bool,

    inbox: Arc<Inbox>,
}

impl Fiber {
    /// Standalone fiber bound to the current thread's environment.
    ///
    /// The caller owns the returned box and must keep it alive until the
    /// fiber has ended or will never be resumed again.
    pub fn new<F>(callback: F) -> SchedResult<Box<Fiber>>
    where
        F: FnOnce() + 'static,
    {
        let env = Environment::current();
        let fiber = Self::with_stack(env, false)?;
        fiber.callback.set(Some(Box::new(callback)));
        Ok(Box::new(fiber))
    }

    pub(crate) fn carrier(inbox: Arc<Inbox>) -> Fiber {
        Fiber {
            ctx: UnsafeCell::new(ExecutionContext::carrier()),
            callback: Cell::new(None),
            id: FiberId::next(),
            // The carrier is running from the moment its thread exists
            started: Cell::new(true),
            ended: Cell::new(false),
            on_stack: Cell::new(true),
            panicked: Cell::new(false),
            hook: Cell::new(false),
            carrier: true,
            pool_owned: false,
            hook_default: false,
            inbox,
        }
    }

    pub(crate) fn with_stack(env: &Environment, pool_owned: bool) -> SchedResult<Fiber> {
        let config = env.config();
        let hook_default = config.hook_by_default;
        Ok(Fiber {
            ctx: UnsafeCell::new(ExecutionContext::with_stack(config.stack_size)?),
            callback: Cell::new(None),
            id: FiberId::next(),
            started: Cell::new(false),
            ended: Cell::new(false),
            on_stack: Cell::new(false),
            panicked: Cell::new(false),
            hook: Cell::new(hook_default),
            carrier: false,
            pool_owned,
            hook_default,
            inbox: env.inbox().clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_flags(self.started.get(), self.ended.get(), self.on_stack.get())
    }

    #[inline]
    pub fn is_carrier(&self) -> bool {
        self.carrier
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended.get()
    }

    #[inline]
    pub fn has_panicked(&self) -> bool {
        self.panicked.get()
    }

    #[inline]
    pub fn is_pool_owned(&self) -> bool {
        self.pool_owned
    }

    #[inline]
    pub fn hook_enabled(&self) -> bool {
        self.hook.get()
    }

    pub fn enable_hook(&self) {
        self.hook.set(true);
    }

    pub fn disable_hook(&self) {
        self.hook.set(false);
    }

    #[inline]
    pub fn handle(&self) -> FiberRef {
        FiberRef(NonNull::from(self))
    }

    #[inline]
    fn ctx_ptr(&self) -> *mut ExecutionContext {
        self.ctx.get()
    }

    pub(crate) fn set_on_stack(&self, on: bool) {
        self.on_stack.set(on);
    }

    /// Switch into this fiber from whatever is running on this thread.
    ///
    /// Returns when the fiber (or something it resumed) suspends back.
    ///
    /// # Panics
    ///
    /// If called from another thread than the fiber's own, on the
    /// carrier, on a fiber that is already running or has ended, or when
    /// the call stack is full.
    pub fn resume(&self) {
        let env = Environment::current();
        assert!(
            Arc::ptr_eq(&self.inbox, env.inbox()),
            "fiber {} resumed on a foreign thread",
            self.id
        );
        assert!(!self.carrier, "the carrier fiber cannot be resumed");
        assert!(!self.on_stack.get(), "fiber {} resumed while running", self.id);
        assert!(!self.ended.get(), "fiber {} resumed after it ended", self.id);

        if !self.started.get() {
            self.started.set(true);
            let arg = self as *const Fiber as usize;
            // Safety: not on the call stack, nothing else borrows ctx
            unsafe { (*self.ctx_ptr()).make(fiber_main, arg, 0) };
        }

        let from = env.current_fiber();
        env.push_fiber(self.handle());
        // Safety: `from` is the running fiber and outlives this swap; our
        // stack is owned by self and mapped
        unsafe { ExecutionContext::swap(from.get().ctx_ptr(), self.ctx_ptr()) };
    }

    /// Give control back to the fiber that resumed this one.
    ///
    /// # Panics
    ///
    /// If this fiber is not the one currently running.
    pub fn suspend(&self) {
        let env = Environment::current();
        assert!(!self.carrier, "the carrier fiber cannot suspend");
        assert!(
            env.current_fiber() == self.handle(),
            "fiber {} suspended while not running",
            self.id
        );

        env.pop_fiber();
        let to = env.current_fiber();
        // Safety: `to` is below us on the call stack, hence suspended in
        // a previous swap and still alive
        unsafe { ExecutionContext::swap(self.ctx_ptr(), to.get().ctx_ptr()) };
    }

    /// Install a new callback on an idle or ended fiber.
    pub fn reset<F>(&self, callback: F) -> SchedResult<()>
    where
        F: FnOnce() + 'static,
    {
        self.reset_boxed(Box::new(callback))
    }

    pub(crate) fn reset_boxed(&self, callback: Callback) -> SchedResult<()> {
        if self.carrier || !self.state().is_resettable() {
            return Err(SchedError::InvalidState);
        }
        self.started.set(false);
        self.ended.set(false);
        self.panicked.set(false);
        self.hook.set(self.hook_default);
        self.callback.set(Some(callback));
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.on_stack.get() && !self.carrier {
            kerror!("fiber {} dropped while running", self.id);
            std::process::abort();
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("carrier", &self.carrier)
            .field("pool_owned", &self.pool_owned)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// First frame of every fiber stack.
extern "C" fn fiber_main(arg: usize, _unused: usize) {
    // Safety: `resume` passed a pointer to a fiber that is on the call
    // stack, so it is alive for as long as this frame runs
    let fiber = unsafe { &*(arg as *const Fiber) };
    let env = Environment::current();
    env.stats().fiber_started();

    if let Some(callback) = fiber.callback.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            fiber.panicked.set(true);
            kerror!("fiber {} panicked: {}", fiber.id, panic_message(&*payload));
        }
    }

    fiber.ended.set(true);
    if fiber.pool_owned {
        env.recycle_fiber_to_pool(fiber.handle());
    }
    env.stats().fiber_ended();
    fiber.suspend();

    // An ended fiber is only ever restarted from the top after `reset`.
    kerror!("ended fiber {} was resumed", fiber.id);
    std::process::abort();
}

/// Copyable, thread-safe reference to a fiber.
///
/// Dereferencing is only sound on the fiber's own thread (see `get`);
/// every other thread may only `wake` it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FiberRef(NonNull<Fiber>);

// Safety: cross-thread use is limited to `wake`, which touches only the
// immutable `Arc<Inbox>` field
unsafe impl Send for FiberRef {}
unsafe impl Sync for FiberRef {}

impl FiberRef {
    /// Borrow the fiber.
    ///
    /// Must only be called on the fiber's own thread while the fiber is
    /// alive. The runtime guarantees both for every `FiberRef` it hands
    /// out to code running in that thread.
    #[inline]
    pub fn get(&self) -> &Fiber {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        unsafe { (*self.0.as_ptr()).id }
    }

    /// Schedule the fiber to be resumed by its own event loop.
    pub fn wake(self) {
        // Safety: `inbox` is set at construction and never mutated
        let inbox = unsafe { &(*self.0.as_ptr()).inbox };
        inbox.push(self);
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const Fiber {
        self.0.as_ptr()
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({:p})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_resume_suspend_lifecycle() {
        let trace = Rc::new(Cell::new(0u32));
        let slot: Rc<Cell<Option<FiberRef>>> = Rc::new(Cell::new(None));

        let fiber = {
            let trace = trace.clone();
            let slot = slot.clone();
            Fiber::new(move || {
                trace.set(1);
                slot.get().unwrap().get().suspend();
                trace.set(2);
            })
            .unwrap()
        };
        slot.set(Some(fiber.handle()));

        assert_eq!(fiber.state(), FiberState::Idle);
        fiber.resume();
        assert_eq!(trace.get(), 1);
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert_eq!(Environment::current().depth(), 1);

        fiber.resume();
        assert_eq!(trace.get(), 2);
        assert_eq!(fiber.state(), FiberState::Ended);
        assert!(!fiber.has_panicked());
    }

    #[test]
    fn test_nested_resume_keeps_stack_discipline() {
        let depths = Rc::new(Cell::new((0usize, 0usize)));
        let d = depths.clone();
        let outer = Fiber::new(move || {
            let env = Environment::current();
            let seen = Rc::new(Cell::new(0));
            let s = seen.clone();
            let inner = Fiber::new(move || s.set(Environment::current().depth())).unwrap();
            inner.resume();
            d.set((env.depth(), seen.get()));
        })
        .unwrap();

        outer.resume();
        assert_eq!(depths.get(), (2, 3));
        assert!(outer.is_ended());
        assert_eq!(Environment::current().depth(), 1);
    }

    #[test]
    fn test_reset_rules() {
        let slot: Rc<Cell<Option<FiberRef>>> = Rc::new(Cell::new(None));
        let s = slot.clone();
        let fiber = Fiber::new(move || s.get().unwrap().get().suspend()).unwrap();
        slot.set(Some(fiber.handle()));

        // Idle may be reset
        let s = slot.clone();
        assert!(fiber.reset(move || s.get().unwrap().get().suspend()).is_ok());

        fiber.resume();
        assert_eq!(fiber.reset(|| {}), Err(SchedError::InvalidState));

        fiber.resume();
        assert!(fiber.is_ended());
        fiber.disable_hook();
        assert!(fiber.reset(|| {}).is_ok());
        assert_eq!(fiber.state(), FiberState::Idle);
        assert_eq!(fiber.hook_enabled(), crate::config::current().hook_by_default);

        let carrier = Environment::current().current_fiber();
        assert_eq!(carrier.get().reset(|| {}), Err(SchedError::InvalidState));
    }

    #[test]
    fn test_panic_is_contained() {
        let before = Environment::current().live_fibers();
        let fiber = Fiber::new(|| panic!("boom")).unwrap();
        fiber.resume();
        assert!(fiber.is_ended());
        assert!(fiber.has_panicked());
        assert_eq!(Environment::current().live_fibers(), before);
    }

    #[test]
    #[should_panic(expected = "after it ended")]
    fn test_resume_after_end_panics() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.resume();
        fiber.resume();
    }

    #[test]
    fn test_ids_are_distinct() {
        let a = Fiber::new(|| {}).unwrap();
        let b = Fiber::new(|| {}).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.handle().id(), a.id());
    }
}
