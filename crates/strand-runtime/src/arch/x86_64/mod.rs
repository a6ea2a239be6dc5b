//! x86_64 context switching
//!
//! Voluntary switches only need the System V callee-saved set plus the
//! stack and instruction pointers. There are no callee-saved vector
//! registers in this ABI, so the block is eight quadwords.

use std::arch::naked_asm;

/// Callee-saved register block of a suspended fiber.
///
/// Field order is load-bearing: the assembly below addresses this block
/// by fixed offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare a fresh context so that the first switch into it runs
/// `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `ctx` must point to writable `Context` memory and `stack_top` must be
/// the one-past-the-end address of a live stack allocation.
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned at the trampoline's `call`, so the callee sees the
    // usual post-call alignment.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First code a new fiber executes: forwards the stashed argument to the
/// stashed entry function. The entry function must never return; it ends
/// the fiber by switching away with a terminal state.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current flow into `save` and load `load`.
///
/// Returns when something later switches back into `save`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` blocks; `load` must hold
/// either a state captured by a previous `switch` or one prepared by
/// `init_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved state into *save (rdi).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load state from *load (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context.
        "2:",
        "ret",
    );
}
