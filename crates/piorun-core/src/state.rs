//! Fiber lifecycle state

/// Lifecycle of a fiber.
///
/// ```text
/// Idle --resume--> Running --suspend--> Suspended --resume--> Running
///                     \
///                      `--callback returns--> Ended --reset--> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, never resumed
    Idle = 0,

    /// On its environment's call stack (executing, or resumed a nested fiber)
    Running = 1,

    /// Started, off the call stack, waiting to be resumed
    Suspended = 2,

    /// Callback returned (or panicked); may be reset if pool-owned
    Ended = 3,
}

impl FiberState {
    /// Derive the state from the raw flags a fiber keeps.
    #[inline]
    pub const fn from_flags(started: bool, ended: bool, on_stack: bool) -> Self {
        match (started, ended, on_stack) {
            (_, true, _) => FiberState::Ended,
            (false, false, _) => FiberState::Idle,
            (true, false, true) => FiberState::Running,
            (true, false, false) => FiberState::Suspended,
        }
    }

    /// Whether `reset` may install a new callback in this state
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Idle | FiberState::Ended)
    }

    /// Whether `resume` may switch into a fiber in this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Idle | FiberState::Suspended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(FiberState::from_flags(false, false, false), FiberState::Idle);
        assert_eq!(FiberState::from_flags(true, false, true), FiberState::Running);
        assert_eq!(FiberState::from_flags(true, false, false), FiberState::Suspended);
        assert_eq!(FiberState::from_flags(true, true, true), FiberState::Ended);
    }

    #[test]
    fn test_transitions_allowed() {
        assert!(FiberState::Idle.is_resettable());
        assert!(FiberState::Ended.is_resettable());
        assert!(!FiberState::Suspended.is_resettable());
        assert!(!FiberState::Running.is_resumable());
        assert!(!FiberState::Ended.is_resumable());
        assert!(FiberState::Suspended.is_resumable());
    }
}
