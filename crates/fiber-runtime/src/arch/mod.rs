//! Architecture-specific context switching
//!
//! Each target module provides:
//! - `ContextRegs`: the callee-saved register set, `#[repr(C)]` with
//!   offsets matched by the assembly
//! - `init_context`: prepare a fresh fiber context so the first switch
//!   lands in the entry trampoline
//! - `context_switch`: save the current callee-saved state and resume
//!   another context

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, ContextRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, ContextRegs};
    } else {
        compile_error!("unsupported target architecture for fiber context switching");
    }
}
