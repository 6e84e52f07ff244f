//! # piorun-runtime
//!
//! Platform-specific implementation of the piorun fiber runtime.
//!
//! This crate provides:
//! - Stack mapping with guard pages (mmap)
//! - Context switching (architecture-specific assembly)
//! - Fibers and the per-thread run environment
//! - The timer wheel and epoll reactor driving each thread's event loop
//! - The pool scheduler and its worker threads
//! - Fiber-aware sync primitives and socket calls

pub mod config;
pub mod memory;
pub mod arch;
pub mod context;
pub mod timer;
pub(crate) mod reactor;
pub mod fiber;
pub mod env;
pub mod event_loop;
pub mod worker;
pub mod scheduler;
pub mod sync;
pub mod hook;
pub mod this_fiber;

// Re-exports
pub use config::RuntimeConfig;
pub use context::ExecutionContext;
pub use env::{worker_binding, EnvStats, Environment, Task};
pub use event_loop::{run_until, run_until_idle, spawn_local};
pub use fiber::{Fiber, FiberRef};
pub use reactor::Poller;
pub use scheduler::{schedule, Scheduler, SchedulerHandle};
pub use timer::TimerWheel;
pub use worker::WorkerPool;

// epoll and the stack layout are Linux-only
cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("piorun-runtime only supports Linux");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
