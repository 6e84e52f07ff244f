//! Fiber stack memory
//!
//! Every fiber owns one `Stack`: an anonymous mapping whose lowest page is
//! `PROT_NONE`, so running off the end faults instead of scribbling over
//! a neighbour. Platform code lives in the `unix` submodule.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix::{map_stack, page_size, unmap_stack};
    } else {
        compile_error!("fiber stacks need mmap");
    }
}

use piorun_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use piorun_core::error::{MemoryError, SchedResult};
use std::ptr::NonNull;

/// An owned, guard-protected stack region.
///
/// ```text
///  base                     base+guard                      base+len
///   |--- guard (PROT_NONE) ---|------- usable stack -------->|  <- top
/// ```
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

// Safety: the mapping is exclusively owned; moving it between threads
// moves ownership, not aliasing.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    pub fn new(size: usize) -> SchedResult<Self> {
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::InvalidSize(size).into());
        }
        let page = page_size();
        let guard = GUARD_SIZE.max(page);
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::InvalidSize(size))?;
        let len = usable
            .checked_add(guard)
            .ok_or(MemoryError::InvalidSize(size))?;

        let base = map_stack(len, guard)?;
        Ok(Self { base, len, guard })
    }

    /// Highest address of the stack (exclusive); stacks grow down from here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: base + len is one-past-the-end of our own mapping
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest usable address, just above the guard page.
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        // Safety: guard < len
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Usable bytes (guard excluded).
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }

    /// Whether `addr` falls inside the usable part of this stack.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() as usize && addr < self.top() as usize
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unmap_stack(self.base, self.len);
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("size", &self.size())
            .finish()
    }
}
