//! Fiber state, stack classes and spawn attributes

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created, not yet started
    Created = 0,

    /// Ready to run, sitting in a run queue
    Ready = 1,

    /// Currently executing on a worker
    Running = 2,

    /// Suspended on an event, lock, sleep or join
    Blocked = 3,

    /// Finished execution, awaiting cleanup
    Finished = 4,
}

impl FiberState {
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Finished)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Created,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Blocked,
            4 => FiberState::Finished,
            _ => FiberState::Created,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

/// Stack size class for a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StackClass {
    /// 32 KiB usable stack
    Small = 0,

    /// 256 KiB usable stack (default)
    Normal = 1,

    /// 8 MiB usable stack
    Large = 2,

    /// No fiber stack: the body runs on a dedicated OS thread
    Pthread = 3,
}

impl StackClass {
    /// Number of stack classes that own pooled mappings (Pthread excluded).
    pub const POOLED: usize = 3;

    /// Usable bytes for this class, 0 for Pthread.
    pub const fn stack_bytes(&self) -> usize {
        match self {
            StackClass::Small => 32 * 1024,
            StackClass::Normal => 256 * 1024,
            StackClass::Large => 8 * 1024 * 1024,
            StackClass::Pthread => 0,
        }
    }

    #[inline]
    pub const fn as_index(&self) -> usize {
        *self as usize
    }
}

impl Default for StackClass {
    fn default() -> Self {
        StackClass::Normal
    }
}

impl fmt::Display for StackClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackClass::Small => write!(f, "small"),
            StackClass::Normal => write!(f, "normal"),
            StackClass::Large => write!(f, "large"),
            StackClass::Pthread => write!(f, "pthread"),
        }
    }
}

/// Spawn attributes for a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberAttr {
    /// Stack size class
    pub stack_class: StackClass,

    /// Batch-start optimization: do not wake idle workers on enqueue.
    /// The spawner must flush pending signals when the batch is done.
    pub no_signal: bool,

    /// The fiber refuses `stop`/`interrupt` requests.
    pub never_quit: bool,
}

impl FiberAttr {
    pub const fn new() -> Self {
        Self {
            stack_class: StackClass::Normal,
            no_signal: false,
            never_quit: false,
        }
    }

    pub const fn with_stack_class(mut self, class: StackClass) -> Self {
        self.stack_class = class;
        self
    }

    pub const fn no_signal(mut self) -> Self {
        self.no_signal = true;
        self
    }

    pub const fn never_quit(mut self) -> Self {
        self.never_quit = true;
        self
    }
}

impl Default for FiberAttr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(FiberState::Finished.is_terminated());
        assert!(!FiberState::Blocked.is_terminated());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            FiberState::Created,
            FiberState::Ready,
            FiberState::Running,
            FiberState::Blocked,
            FiberState::Finished,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_stack_classes() {
        assert!(StackClass::Small.stack_bytes() < StackClass::Normal.stack_bytes());
        assert!(StackClass::Normal.stack_bytes() < StackClass::Large.stack_bytes());
        assert_eq!(StackClass::Pthread.stack_bytes(), 0);
    }

    #[test]
    fn test_attr_builder() {
        let attr = FiberAttr::new()
            .with_stack_class(StackClass::Small)
            .no_signal();
        assert_eq!(attr.stack_class, StackClass::Small);
        assert!(attr.no_signal);
        assert!(!attr.never_quit);
    }
}
