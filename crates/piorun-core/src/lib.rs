//! # piorun-core
//!
//! Core types for the piorun fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, epoll, stacks and the schedulers live in
//! `piorun-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle enum
//! - `error` - Error types
//! - `spinlock` - Short-hold spin lock used by waiter queues and inboxes
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable helpers

pub mod id;
pub mod state;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;

pub use id::FiberId;
pub use state::FiberState;
pub use error::{MemoryError, SchedError, SchedResult, TryRecvError, TrySendError, WorkerError};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt};

/// Runtime-wide constants
pub mod constants {
    /// Guard page below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest stack a fiber may be given
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Upper bound on worker threads per scheduler
    pub const MAX_WORKERS: usize = 256;

    /// Sentinel index for arena-backed lists
    pub const NONE_U32: u32 = u32::MAX;
}
