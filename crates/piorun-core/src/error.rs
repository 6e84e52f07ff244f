//! Error types for the piorun runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Fiber is in the wrong lifecycle state for the operation
    /// (e.g. `reset` on a running fiber or on the carrier)
    InvalidState,

    /// Scheduler not initialized
    NotInitialized,

    /// Scheduler already initialized
    AlreadyInitialized,

    /// Stack mapping failed
    MemoryError(MemoryError),

    /// Worker thread error
    WorkerError(WorkerError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidState => write!(f, "invalid fiber state"),
            SchedError::NotInitialized => write!(f, "scheduler not initialized"),
            SchedError::AlreadyInitialized => write!(f, "scheduler already initialized"),
            SchedError::MemoryError(e) => write!(f, "memory error: {}", e),
            SchedError::WorkerError(e) => write!(f, "worker error: {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

/// Stack memory errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect on the guard page failed
    ProtectionFailed,

    /// Requested stack is below the minimum or overflows usize
    InvalidSize(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::InvalidSize(size) => write!(f, "invalid stack size {}", size),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::MemoryError(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,

    /// epoll instance could not be created for the worker
    PollerFailed(i32),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::PollerFailed(errno) => {
                write!(f, "failed to create epoll instance (errno {})", errno)
            }
        }
    }
}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::WorkerError(e)
    }
}

/// Error returned when sending on a full channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrySendError<T>(pub T);

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel full")
    }
}

impl<T: fmt::Debug> std::error::Error for TrySendError<T> {}

/// Error returned when receiving from an empty channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryRecvError;

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel empty")
    }
}

impl std::error::Error for TryRecvError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", SchedError::InvalidState), "invalid fiber state");
        assert_eq!(
            format!("{}", SchedError::NotInitialized),
            "scheduler not initialized"
        );

        let e = SchedError::MemoryError(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: stack allocation failed");

        let e = SchedError::WorkerError(WorkerError::PollerFailed(24));
        assert_eq!(
            format!("{}", e),
            "worker error: failed to create epoll instance (errno 24)"
        );
    }

    #[test]
    fn test_error_conversion() {
        let sched_err: SchedError = MemoryError::InvalidSize(12).into();
        assert!(matches!(sched_err, SchedError::MemoryError(MemoryError::InvalidSize(12))));

        let sched_err: SchedError = WorkerError::SpawnFailed.into();
        assert_eq!(sched_err, SchedError::WorkerError(WorkerError::SpawnFailed));
    }

    #[test]
    fn test_try_send_returns_value() {
        let err = TrySendError(String::from("payload"));
        assert_eq!(err.to_string(), "channel full");
        assert_eq!(err.into_inner(), "payload");
    }
}
