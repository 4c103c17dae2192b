//! aarch64 context switching
//!
//! TODO: implement with x19-x28/fp/lr/sp save-restore and a d8-d15
//! spill area, mirroring the x86_64 layout.

/// Callee-saved register set for aarch64.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextRegs {
    pub sp: u64,
    pub pc: u64,
    pub x19_x28: [u64; 10],
    pub fp: u64,
    pub lr: u64,
}

impl ContextRegs {
    pub const fn zeroed() -> Self {
        ContextRegs {
            sp: 0,
            pc: 0,
            x19_x28: [0; 10],
            fp: 0,
            lr: 0,
        }
    }
}

/// Prepare a fresh fiber context.
pub unsafe fn init_context(
    _regs: *mut ContextRegs,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Save the current context and resume another.
pub unsafe extern "C" fn context_switch(
    _old_regs: *mut ContextRegs,
    _new_regs: *const ContextRegs,
) {
    todo!("aarch64 context_switch not yet implemented")
}
