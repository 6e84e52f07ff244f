//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on `RuntimeConfig`
//! 2. Environment variables (runtime)
//! 3. User's pio_config.rs (compile-time, `PIO_CONFIG_RS`)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use piorun_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .num_workers(2)
//!     .stack_size(256 * 1024);
//! config.validate()?;
//! ```

pub mod defaults;

use piorun_core::constants::{MAX_WORKERS, MIN_STACK_SIZE};
use piorun_core::env::{env_get, env_get_bool};
use piorun_core::kprint::{self, LogLevel};
use std::sync::OnceLock;
use std::time::Duration;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads spawned by a `Scheduler`
    pub num_workers: usize,
    /// Bytes of stack per fiber (guard page excluded)
    pub stack_size: usize,
    /// Capacity of each thread's fiber call stack
    pub call_stack_depth: usize,
    /// Timer wheel span in milliseconds
    pub wheel_slots: usize,
    /// Upper bound on how long one event-loop tick blocks in epoll
    pub poll_timeout: Duration,
    /// epoll events harvested per tick
    pub epoll_events: usize,
    /// Fibers allocated at once when a pool runs dry
    pub pool_batch: usize,
    /// Shared-queue tasks a worker takes per tick
    pub task_batch: usize,
    /// Whether pooled fibers start with syscall hooking enabled
    pub hook_by_default: bool,
    /// Raise the kprint level to at least `Debug` when a scheduler starts
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PIO_NUM_WORKERS`
    /// - `PIO_STACK_SIZE`
    /// - `PIO_CALL_STACK_DEPTH`
    /// - `PIO_WHEEL_SLOTS`
    /// - `PIO_POLL_TIMEOUT_MS`
    /// - `PIO_EPOLL_EVENTS`
    /// - `PIO_POOL_BATCH`
    /// - `PIO_TASK_BATCH`
    /// - `PIO_HOOK_BY_DEFAULT` (0/1)
    /// - `PIO_DEBUG` (0/1)
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("PIO_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_size: env_get("PIO_STACK_SIZE", defaults::STACK_SIZE),
            call_stack_depth: env_get("PIO_CALL_STACK_DEPTH", defaults::CALL_STACK_DEPTH),
            wheel_slots: env_get("PIO_WHEEL_SLOTS", defaults::WHEEL_SLOTS),
            poll_timeout: Duration::from_millis(env_get(
                "PIO_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
            epoll_events: env_get("PIO_EPOLL_EVENTS", defaults::EPOLL_EVENTS),
            pool_batch: env_get("PIO_POOL_BATCH", defaults::POOL_BATCH),
            task_batch: env_get("PIO_TASK_BATCH", defaults::TASK_BATCH),
            hook_by_default: env_get_bool("PIO_HOOK_BY_DEFAULT", defaults::HOOK_BY_DEFAULT),
            debug_logging: env_get_bool("PIO_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Library defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stack_size: defaults::STACK_SIZE,
            call_stack_depth: defaults::CALL_STACK_DEPTH,
            wheel_slots: defaults::WHEEL_SLOTS,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            epoll_events: defaults::EPOLL_EVENTS,
            pool_batch: defaults::POOL_BATCH,
            task_batch: defaults::TASK_BATCH,
            hook_by_default: defaults::HOOK_BY_DEFAULT,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn call_stack_depth(mut self, depth: usize) -> Self {
        self.call_stack_depth = depth;
        self
    }

    pub fn wheel_slots(mut self, slots: usize) -> Self {
        self.wheel_slots = slots;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn epoll_events(mut self, n: usize) -> Self {
        self.epoll_events = n;
        self
    }

    pub fn pool_batch(mut self, n: usize) -> Self {
        self.pool_batch = n;
        self
    }

    pub fn task_batch(mut self, n: usize) -> Self {
        self.task_batch = n;
        self
    }

    pub fn hook_by_default(mut self, enable: bool) -> Self {
        self.hook_by_default = enable;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Raise the log level to `Debug` if `debug_logging` asks for it.
    /// A more verbose level already in force is left alone.
    pub(crate) fn apply_log_level(&self) {
        if self.debug_logging && kprint::log_level() < LogLevel::Debug {
            kprint::set_log_level(LogLevel::Debug);
        }
    }

    /// epoll_wait takes an int millisecond timeout.
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        self.poll_timeout.as_millis().min(i32::MAX as u128) as i32
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.call_stack_depth < 2 {
            return Err(ConfigError::InvalidValue("call_stack_depth must be >= 2"));
        }
        if self.wheel_slots == 0 {
            return Err(ConfigError::InvalidValue("wheel_slots must be > 0"));
        }
        if self.epoll_events == 0 {
            return Err(ConfigError::InvalidValue("epoll_events must be > 0"));
        }
        if self.pool_batch == 0 {
            return Err(ConfigError::InvalidValue("pool_batch must be > 0"));
        }
        if self.task_batch == 0 {
            return Err(ConfigError::InvalidValue("task_batch must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("piorun configuration:");
        eprintln!("  num_workers:        {}", self.num_workers);
        eprintln!("  stack_size:         {}", self.stack_size);
        eprintln!("  call_stack_depth:   {}", self.call_stack_depth);
        eprintln!("  wheel_slots:        {}", self.wheel_slots);
        eprintln!("  poll_timeout:       {:?}", self.poll_timeout);
        eprintln!("  epoll_events:       {}", self.epoll_events);
        eprintln!("  pool_batch:         {}", self.pool_batch);
        eprintln!("  task_batch:         {}", self.task_batch);
        eprintln!("  hook_by_default:    {}", self.hook_by_default);
        eprintln!("  debug_logging:      {}", self.debug_logging);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
    /// `install` was called after environments already read the config
    AlreadyInstalled,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
            ConfigError::AlreadyInstalled => write!(f, "config already installed"),
        }
    }
}

impl std::error::Error for ConfigError {}

static PROCESS_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration read by thread environments
/// that no scheduler configured.
///
/// Must happen before the first such environment is touched; afterwards
/// the already-frozen config stays in force. Scheduler workers use the
/// config their scheduler was started with instead.
pub fn install(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    PROCESS_CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInstalled)
}

/// The process-wide configuration (env defaults if nothing was installed).
pub fn current() -> &'static RuntimeConfig {
    PROCESS_CONFIG.get_or_init(RuntimeConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.stack_size, 128 * 1024);
        assert_eq!(config.wheel_slots, 60_000);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_workers(8)
            .poll_timeout(Duration::from_millis(5))
            .hook_by_default(false);

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_timeout_ms(), 5);
        assert!(!config.hook_by_default);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().num_workers(1000).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(4096).validate().is_err());
        assert!(RuntimeConfig::new().call_stack_depth(1).validate().is_err());
        assert!(RuntimeConfig::new().wheel_slots(0).validate().is_err());
    }

    #[test]
    fn test_debug_logging_raises_level() {
        RuntimeConfig::new().debug_logging(false).apply_log_level();
        RuntimeConfig::new().debug_logging(true).apply_log_level();
        assert!(kprint::log_level() >= LogLevel::Debug);

        // Never lowers a more verbose level
        kprint::set_log_level(LogLevel::Trace);
        RuntimeConfig::new().debug_logging(true).apply_log_level();
        assert_eq!(kprint::log_level(), LogLevel::Trace);
        kprint::set_log_level(LogLevel::Info);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PIO_POOL_BATCH", "3");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.pool_batch, 3);
        std::env::remove_var("PIO_POOL_BATCH");
    }
}
