//! Execution contexts: a saved register set plus an optional private stack.

use crate::arch::{self, EntryFn, Registers};
use crate::memory::Stack;
use piorun_core::error::SchedResult;

/// A resumable point of execution.
///
/// Carrier contexts (an OS thread's original stack) own no `Stack`; their
/// registers are only ever written by `swap`.
#[derive(Debug)]
pub struct ExecutionContext {
    regs: Registers,
    stack: Option<Stack>,
}

impl ExecutionContext {
    /// Context for the thread's own stack.
    pub fn carrier() -> Self {
        Self {
            regs: Registers::default(),
            stack: None,
        }
    }

    /// Context with a freshly mapped private stack of `stack_size` bytes.
    pub fn with_stack(stack_size: usize) -> SchedResult<Self> {
        Ok(Self {
            regs: Registers::default(),
            stack: Some(Stack::new(stack_size)?),
        })
    }

    #[inline]
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    #[inline]
    pub fn stack(&self) -> Option<&Stack> {
        self.stack.as_ref()
    }

    /// Arrange for the next switch into this context to run
    /// `entry(arg1, arg2)` from the top of the private stack.
    ///
    /// Returns `false` (and does nothing) for a carrier context.
    pub fn make(&mut self, entry: EntryFn, arg1: usize, arg2: usize) -> bool {
        let Some(stack) = self.stack.as_ref() else {
            return false;
        };
        // Safety: the stack is owned by self and lives as long as regs
        unsafe { arch::init_context(&mut self.regs, stack.top(), entry, arg1, arg2) };
        true
    }

    /// Save the running state into `from` and continue in `to`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the whole time `from` is suspended,
    /// `to` must hold state written by `make` or by a previous `swap`, and
    /// the stack behind `to` must still be mapped.
    #[inline]
    pub unsafe fn swap(from: *mut ExecutionContext, to: *const ExecutionContext) {
        arch::switch_context(
            std::ptr::addr_of_mut!((*from).regs),
            std::ptr::addr_of!((*to).regs),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct PingPong {
        main: ExecutionContext,
        side: ExecutionContext,
        trace: Cell<u32>,
    }

    extern "C" fn side_entry(arg1: usize, arg2: usize) {
        let pp = unsafe { &mut *(arg1 as *mut PingPong) };
        pp.trace.set(pp.trace.get() * 10 + arg2 as u32);
        unsafe { ExecutionContext::swap(&mut pp.side, &pp.main) };
        pp.trace.set(pp.trace.get() * 10 + 3);
        unsafe { ExecutionContext::swap(&mut pp.side, &pp.main) };
        unreachable!("side context resumed after final switch");
    }

    #[test]
    fn test_make_and_swap_round_trip() {
        let mut pp = Box::new(PingPong {
            main: ExecutionContext::carrier(),
            side: ExecutionContext::with_stack(64 * 1024).unwrap(),
            trace: Cell::new(0),
        });
        let raw: *mut PingPong = &mut *pp;
        assert!(pp.side.make(side_entry, raw as usize, 1));

        unsafe {
            ExecutionContext::swap(&mut (*raw).main, &(*raw).side);
            (*raw).trace.set((*raw).trace.get() * 10 + 2);
            ExecutionContext::swap(&mut (*raw).main, &(*raw).side);
        }
        assert_eq!(pp.trace.get(), 123);
    }

    #[test]
    fn test_carrier_cannot_be_made() {
        let mut ctx = ExecutionContext::carrier();
        assert!(!ctx.has_stack());
        assert!(!ctx.make(side_entry, 0, 0));
    }
}
