//! # piorun - stackful fibers on per-thread event loops
//!
//! Every worker thread runs its own epoll event loop and a pool of
//! stackful fibers. Fibers suspend on sleeps, sync primitives and hooked
//! socket calls, and the loop resumes them when their wait completes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use piorun::{sync::channel, this_fiber, Runtime, RuntimeConfig};
//! use std::time::Duration;
//!
//! fn main() {
//!     let mut runtime = Runtime::new(RuntimeConfig::default());
//!     runtime
//!         .block_on(|| {
//!             let (tx, rx) = channel(16);
//!             piorun::schedule(move || {
//!                 for i in 0..5 {
//!                     tx.send(i);
//!                     this_fiber::sleep_for(Duration::from_millis(10));
//!                 }
//!             })
//!             .unwrap();
//!             piorun::schedule(move || {
//!                 for _ in 0..5 {
//!                     println!("received {}", rx.recv());
//!                 }
//!             })
//!             .unwrap();
//!         })
//!         .unwrap();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        schedule(), this_fiber, sync, hook::net              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Pool Scheduler                            │
//! │        shared SegQueue, per-worker local queues             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Worker   │
//!    │ event loop│      │ event loop│      │ event loop│
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │   per thread: epoll + timer wheel + fiber pool + inbox  │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use piorun_core::{FiberId, FiberState, SchedError, SchedResult, TryRecvError, TrySendError};

// Re-export kprint macros for debug logging
pub use piorun_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use piorun_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use piorun_core::{env_get, env_get_bool, env_get_millis, env_get_opt};

// Re-export runtime types
pub use piorun_runtime::{
    hook, sync, this_fiber, Environment, Fiber, FiberRef, RuntimeConfig, Scheduler,
    SchedulerHandle,
};
pub use piorun_runtime::event_loop::{run_until, run_until_idle, spawn_local};

/// Owns the process-global scheduler used by [`schedule`].
///
/// Nothing runs until `start()` or `block_on()`.
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Option<Scheduler>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            scheduler: None,
        }
    }

    /// Spawn the workers and install them as the global scheduler.
    pub fn start(&mut self) -> SchedResult<()> {
        if self.scheduler.is_some() {
            return Err(SchedError::AlreadyInitialized);
        }
        let mut scheduler = Scheduler::start(self.config.clone())?;
        if let Err(e) = scheduler.install_global() {
            let _ = scheduler.shutdown();
            return Err(e);
        }
        self.scheduler = Some(scheduler);
        Ok(())
    }

    /// Start, run `f` on the calling thread, then shut down once every
    /// scheduled fiber has finished.
    pub fn block_on<F, T>(&mut self, f: F) -> SchedResult<T>
    where
        F: FnOnce() -> T,
    {
        self.start()?;
        let result = f();
        self.shutdown()?;
        Ok(result)
    }

    /// Schedule onto this runtime's workers.
    pub fn schedule<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.scheduler {
            Some(s) => s.schedule(f),
            None => Err(SchedError::NotInitialized),
        }
    }

    pub fn handle(&self) -> Option<SchedulerHandle> {
        self.scheduler.as_ref().map(Scheduler::handle)
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Fibers started and not yet finished across all workers.
    pub fn live_fibers(&self) -> usize {
        self.scheduler.as_ref().map_or(0, Scheduler::live_fibers)
    }

    /// Wait for the workers to drain and join them.
    pub fn shutdown(&mut self) -> SchedResult<()> {
        match self.scheduler.take() {
            Some(mut s) => s.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            kwarn!("runtime shutdown: {}", e);
        }
    }
}

/// Run `f` on a fiber: on the current worker when called from one,
/// otherwise on the global scheduler a `Runtime` installed.
///
/// Returns `SchedError::NotInitialized` when there is neither.
#[inline]
pub fn schedule<F>(f: F) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    piorun_runtime::schedule(f)
}

/// Yield to the other fibers of this thread (the OS thread outside one).
#[inline]
pub fn yield_now() {
    this_fiber::yield_now()
}

/// Id of the running fiber.
#[inline]
pub fn current_id() -> FiberId {
    this_fiber::get_id()
}

/// Whether the caller runs on a fiber rather than a thread's own stack.
#[inline]
pub fn is_in_fiber() -> bool {
    Environment::current().in_fiber()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    // The global scheduler slot is process-wide
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::new().num_workers(2)
    }

    #[test]
    fn test_block_on_drains_scheduled_work() {
        let _g = serial();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let mut rt = Runtime::new(config());
        let out = rt
            .block_on(move || {
                for _ in 0..10 {
                    let d = d.clone();
                    schedule(move || {
                        this_fiber::sleep_for(Duration::from_millis(5));
                        d.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
                "scheduled"
            })
            .unwrap();
        assert_eq!(out, "scheduled");
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(!rt.is_running());
    }

    #[test]
    fn test_schedule_without_runtime_fails() {
        let _g = serial();
        assert_eq!(schedule(|| {}), Err(SchedError::NotInitialized));
    }

    #[test]
    fn test_second_runtime_cannot_take_global_slot() {
        let _g = serial();
        let mut first = Runtime::new(config());
        first.start().unwrap();
        assert_eq!(first.start(), Err(SchedError::AlreadyInitialized));

        let mut second = Runtime::new(config());
        assert_eq!(second.start(), Err(SchedError::AlreadyInitialized));
        assert!(!second.is_running());

        first.shutdown().unwrap();
        second.start().unwrap();
        second.shutdown().unwrap();
    }

    #[test]
    fn test_nested_schedule_from_fiber_stays_on_worker() {
        let _g = serial();
        let same = Arc::new(AtomicUsize::new(0));
        let s = same.clone();
        let mut rt = Runtime::new(config());
        rt.block_on(move || {
            schedule(move || {
                let outer = this_fiber::get_thread_id();
                assert!(is_in_fiber());
                schedule(move || {
                    if this_fiber::get_thread_id() == outer {
                        s.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(same.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fiber_mutex_across_workers() {
        let _g = serial();
        let counter = Arc::new(sync::Mutex::new(0u64));
        let c = counter.clone();
        let start = Instant::now();
        let mut rt = Runtime::new(config());
        rt.block_on(move || {
            for _ in 0..8 {
                let c = c.clone();
                schedule(move || {
                    for _ in 0..100 {
                        *c.lock() += 1;
                        yield_now();
                    }
                })
                .unwrap();
            }
        })
        .unwrap();
        assert_eq!(*counter.lock(), 800);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
