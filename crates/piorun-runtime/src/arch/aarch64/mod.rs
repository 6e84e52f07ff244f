//! aarch64 context switching implementation
//!
//! AAPCS64 callee-saved set: x19-x28, fp (x29), lr (x30), sp and the low
//! halves of v8-v15 (d8-d15).

use super::EntryFn;
use std::arch::naked_asm;

/// Saved callee-saved state of a suspended context.
///
/// Offsets are hard-coded in `switch_context`; keep the field order.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub sp: u64,       // 0x00
    pub lr: u64,       // 0x08, resume address
    pub x19_x28: [u64; 10], // 0x10..0x60
    pub fp: u64,       // 0x60
    pub d8_d15: [u64; 8], // 0x68..0xa8
}

/// Prepare `regs` so that switching in runs `entry(arg1, arg2)` on the
/// stack whose highest usable address is `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the top of a live, writable stack that outlives
/// every switch into `regs`.
#[inline]
pub unsafe fn init_context(
    regs: &mut Registers,
    stack_top: *mut u8,
    entry: EntryFn,
    arg1: usize,
    arg2: usize,
) {
    let aligned_sp = (stack_top as usize) & !0xF;

    let mut saved = [0u64; 10];
    saved[0] = entry as usize as u64; // x19
    saved[1] = arg1 as u64; // x20
    saved[2] = arg2 as u64; // x21

    *regs = Registers {
        sp: aligned_sp as u64,
        lr: fiber_entry_trampoline as usize as u64,
        x19_x28: saved,
        fp: 0,
        d8_d15: [0; 8],
    };
}

/// First code run on a fresh stack: `entry(x20, x21)`.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "mov x1, x21",
        "blr x19",
        "brk #0",
    );
}

/// Save the live callee-saved state into `from` and resume `to`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        // Save into from (x0)
        "mov x9, sp",
        "stp x9, x30, [x0, #0x00]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from to (x1)
        "ldp x9, x30, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
