//! Error types for the fiber scheduler

use core::fmt;

/// Result type for scheduler operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Crate-defined code for "scheduler is stopping" (no POSIX equivalent).
pub const ESTOP: i32 = 1006;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberError {
    /// Fiber slot, token slot or stack allocation failed
    NoResource,

    /// Handle version mismatch: the slot was destroyed or reused
    StaleHandle,

    /// Resource is held by someone else (trylock on a held lock)
    Busy,

    /// Operation not permitted in the current state
    /// (e.g. locking a token that is about to be destroyed)
    Permission,

    /// Timed wait elapsed
    TimedOut,

    /// Blocking call was interrupted; caller should re-check its condition
    Interrupted,

    /// Value already differed at wait time; no blocking occurred
    WouldBlock,

    /// Scheduler is stopping; blocking calls should unwind, not retry
    Stopped,

    /// Scheduler not initialized
    NotInitialized,

    /// Scheduler already initialized
    AlreadyInitialized,

    /// Stack mapping or protection change failed
    StackAllocation,

    /// Caller passed an out-of-range or nonsensical argument
    InvalidArgument,
}

impl FiberError {
    /// Map to the errno-style code the original C ABI reports.
    pub fn errno(&self) -> i32 {
        match self {
            FiberError::NoResource => libc::ENOMEM,
            FiberError::StaleHandle => libc::EINVAL,
            FiberError::Busy => libc::EBUSY,
            FiberError::Permission => libc::EPERM,
            FiberError::TimedOut => libc::ETIMEDOUT,
            FiberError::Interrupted => libc::EINTR,
            FiberError::WouldBlock => libc::EAGAIN,
            FiberError::Stopped => ESTOP,
            FiberError::NotInitialized => libc::EINVAL,
            FiberError::AlreadyInitialized => libc::EEXIST,
            FiberError::StackAllocation => libc::ENOMEM,
            FiberError::InvalidArgument => libc::EINVAL,
        }
    }
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::NoResource => write!(f, "no fiber resources available"),
            FiberError::StaleHandle => write!(f, "stale or unknown handle"),
            FiberError::Busy => write!(f, "resource busy"),
            FiberError::Permission => write!(f, "operation not permitted"),
            FiberError::TimedOut => write!(f, "operation timed out"),
            FiberError::Interrupted => write!(f, "operation interrupted"),
            FiberError::WouldBlock => write!(f, "value changed, would not block"),
            FiberError::Stopped => write!(f, "scheduler stopping"),
            FiberError::NotInitialized => write!(f, "scheduler not initialized"),
            FiberError::AlreadyInitialized => write!(f, "scheduler already initialized"),
            FiberError::StackAllocation => write!(f, "stack allocation failed"),
            FiberError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for FiberError {}
