//! Unix stack mapping using mmap

use piorun_core::error::{MemoryError, SchedResult};
use piorun_core::kwarn;
use std::ptr::NonNull;
use std::sync::OnceLock;

pub(super) fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

/// Map `len` bytes read/write and turn the lowest `guard` bytes into a
/// no-access guard.
pub(super) fn map_stack(len: usize, guard: usize) -> SchedResult<NonNull<u8>> {
    // MAP_NORESERVE: physical pages only materialise when a fiber touches
    // them, so a deep pool of mostly idle fibers stays cheap.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed.into());
    }

    let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
    if ret != 0 {
        unsafe {
            libc::munmap(base, len);
        }
        return Err(MemoryError::ProtectionFailed.into());
    }

    NonNull::new(base as *mut u8).ok_or_else(|| MemoryError::AllocationFailed.into())
}

pub(super) fn unmap_stack(base: NonNull<u8>, len: usize) {
    let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, len) };
    if ret != 0 {
        kwarn!(
            "munmap of fiber stack {:p} ({} bytes) failed: {}",
            base.as_ptr(),
            len,
            nix::errno::Errno::last()
        );
    }
}
