//! Thread-local scheduler context
//!
//! Worker threads publish their `TaskGroup` here for the duration of the
//! worker loop; the running fiber id is set around each fiber slice.
//! Blocking primitives consult these to decide between the fiber path
//! (suspend and switch to the scheduler) and the thread path (park the
//! OS thread).

use std::cell::Cell;

use fiber_core::FiberId;

use crate::task_group::TaskGroup;

thread_local! {
    static CURRENT_GROUP: Cell<*const TaskGroup> = const { Cell::new(std::ptr::null()) };
    static CURRENT_FIBER: Cell<u64> = const { Cell::new(0) };
}

/// Publish the group for this worker thread. The pointer must stay
/// valid until [`clear_current_group`]; workers hold an `Arc` for the
/// whole loop, so it does.
pub(crate) fn set_current_group(group: *const TaskGroup) {
    CURRENT_GROUP.with(|c| c.set(group));
}

pub(crate) fn clear_current_group() {
    CURRENT_GROUP.with(|c| c.set(std::ptr::null()));
}

#[inline]
pub(crate) fn current_group_ptr() -> *const TaskGroup {
    CURRENT_GROUP.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current_fiber(id: FiberId) {
    CURRENT_FIBER.with(|c| c.set(id.as_u64()));
}

#[inline]
pub(crate) fn clear_current_fiber() {
    CURRENT_FIBER.with(|c| c.set(0));
}

#[inline]
pub(crate) fn current_fiber() -> FiberId {
    FiberId::from_raw(CURRENT_FIBER.with(|c| c.get()))
}

/// True when called from fiber context (on a fiber stack, inside a
/// worker). The slow paths use this to pick thread-blocking fallbacks.
#[inline]
pub(crate) fn in_fiber() -> bool {
    current_fiber().is_some() && !current_group_ptr().is_null()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert!(current_group_ptr().is_null());
        assert!(current_fiber().is_none());
        assert!(!in_fiber());
    }

    #[test]
    fn test_fiber_id_roundtrip() {
        let id = FiberId::new(5, 3);
        set_current_fiber(id);
        assert_eq!(current_fiber(), id);
        clear_current_fiber();
        assert!(current_fiber().is_none());
    }
}
