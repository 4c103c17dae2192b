//! x86_64 context switching
//!
//! Only the System V callee-saved registers are switched; caller-saved
//! state is dead at every voluntary switch point, which is what makes
//! cooperative switching an order of magnitude cheaper than a signal
//! frame restore.

use std::arch::naked_asm;

/// Callee-saved register set. Field order is fixed: the assembly in
/// [`context_switch`] addresses fields by byte offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl ContextRegs {
    pub const fn zeroed() -> Self {
        ContextRegs {
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

/// Prepare a fresh fiber context.
///
/// The first switch into `regs` starts execution at the entry
/// trampoline, which calls `entry_fn(entry_arg)` and then the finish
/// hook when it returns.
///
/// # Safety
///
/// `regs` must be valid for writes and `stack_top` must point one past
/// the end of a mapped stack region.
#[inline]
pub unsafe fn init_context(
    regs: *mut ContextRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // The trampoline is entered by `jmp`, not `call`, so rsp must be
    // 16-byte aligned here: its first `call` then leaves rsp at the
    // 8-mod-16 alignment the ABI requires at function entry.
    let sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First frame of every fiber: call the entry with its argument, then
/// hand control to the finish hook. The hook switches away and never
/// returns; `ud2` traps if it somehow does.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finish}",
        "ud2",
        finish = sym crate::task_group::fiber_finish_hook,
    );
}

/// Save the current callee-saved state into `old_regs` and resume
/// `new_regs`.
///
/// Returns (to the saved `1:` label) when some later switch restores
/// `old_regs`.
///
/// # Safety
///
/// Both pointers must reference valid `ContextRegs`; `new_regs` must
/// hold a context prepared by [`init_context`] or saved by a previous
/// switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _old_regs: *mut ContextRegs,
    _new_regs: *const ContextRegs,
) {
    naked_asm!(
        // Save callee-saved registers into old_regs (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load the new context from new_regs (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regs_layout() {
        // The asm hardcodes these offsets
        assert_eq!(std::mem::offset_of!(ContextRegs, rsp), 0x00);
        assert_eq!(std::mem::offset_of!(ContextRegs, rip), 0x08);
        assert_eq!(std::mem::offset_of!(ContextRegs, rbx), 0x10);
        assert_eq!(std::mem::offset_of!(ContextRegs, rbp), 0x18);
        assert_eq!(std::mem::offset_of!(ContextRegs, r12), 0x20);
        assert_eq!(std::mem::offset_of!(ContextRegs, r13), 0x28);
        assert_eq!(std::mem::offset_of!(ContextRegs, r14), 0x30);
        assert_eq!(std::mem::offset_of!(ContextRegs, r15), 0x38);
        assert_eq!(std::mem::size_of::<ContextRegs>(), 0x40);
    }

    #[test]
    fn test_init_context_alignment() {
        let mut regs = ContextRegs::zeroed();
        let fake_top = 0x7fff_dead_b007usize as *mut u8;
        unsafe { init_context(&mut regs, fake_top, 0x1000, 0x2000) };
        assert_eq!(regs.rsp % 16, 0);
        assert_eq!(regs.r12, 0x1000);
        assert_eq!(regs.r13, 0x2000);
    }
}
