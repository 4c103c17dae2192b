//! # fiber-core
//!
//! Core types for the fiber scheduler - platform agnostic.
//!
//! All platform-specific code (stacks, context switching, futex parking)
//! lives in `fiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber, token and timer identifier types
//! - `attr` - Fiber state, stack classes, spawn attributes
//! - `error` - Error types and errno mapping
//! - `spinlock` - Internal spinlock primitive
//! - `small_queue` - Inline-then-heap FIFO for pending errors
//! - `flog` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod attr;
pub mod env;
pub mod error;
pub mod flog;
pub mod id;
pub mod small_queue;
pub mod spinlock;

// Re-exports for convenience
pub use attr::{FiberAttr, FiberState, StackClass};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{FiberError, FiberResult, ESTOP};
pub use id::{FiberId, TimerId, Token};
pub use small_queue::SmallQueue;
pub use spinlock::{SpinLock, SpinLockGuard};

/// Layout and sizing constants
pub mod constants {
    /// Maximum worker OS threads per scheduler
    pub const MAX_WORKERS: usize = 64;

    /// Default number of fiber slots
    pub const DEFAULT_MAX_FIBERS: usize = 65536;

    /// Guard page size below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Per-worker run queue capacity (power of two)
    pub const RUN_QUEUE_CAPACITY: usize = 4096;

    /// Timer thread bucket count
    pub const TIMER_BUCKETS: usize = 13;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;
}
