//! x86_64 context switching implementation
//!
//! System V AMD64: only rsp, rbx, rbp and r12-r15 survive a call, so a
//! voluntary switch saves exactly those plus the resume address.
//! Requires Rust 1.88+ for `#[unsafe(naked)]`.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved callee-saved state of a suspended context.
///
/// Offsets are hard-coded in `switch_context`; keep the field order.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
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
    // 16-byte aligned before the trampoline's `call`, so the callee sees
    // rsp % 16 == 8 at its first instruction as the ABI expects.
    let aligned_sp = (stack_top as usize) & !0xF;

    *regs = Registers {
        rsp: aligned_sp as u64,
        rip: fiber_entry_trampoline as usize as u64,
        rbx: 0,
        rbp: 0,
        r12: entry as usize as u64,
        r13: arg1 as u64,
        r14: arg2 as u64,
        r15: 0,
    };
}

/// First code run on a fresh stack: `entry(r13, r14)`.
///
/// The entry function never returns; if it does, trap.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "mov rsi, r14",
        "call r12",
        "ud2",
    );
}

/// Save the live callee-saved state into `from` and resume `to`.
///
/// Returns when another context switches back into `from`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Registers, _to: *const Registers) {
    naked_asm!(
        // Save into from (RDI); rsp still points at our return address
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from to (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a context saved above
        "1:",
        "ret",
    );
}
