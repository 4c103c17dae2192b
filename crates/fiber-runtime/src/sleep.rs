//! Cooperative sleep and yield
//!
//! In fiber context these suspend only the fiber; the worker moves on
//! to other work. Outside fiber context they degrade to the plain
//! thread operations so the same code runs in both worlds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fiber_core::{FiberError, FiberId, FiberResult};

use crate::event::{Waiter, WAKE_INTERRUPTED, WAKE_WOKEN};
use crate::tls;

/// Id of the calling fiber, or `None` on a plain thread.
pub fn current_fiber_id() -> Option<FiberId> {
    if tls::in_fiber() {
        Some(tls::current_fiber())
    } else {
        None
    }
}

/// Give up the current slice. The fiber goes to the back of its
/// worker's queue; other ready fibers run first.
pub fn yield_now() {
    if tls::in_fiber() {
        // Safety: in_fiber() implies a live group on this thread
        let group = unsafe { &*tls::current_group_ptr() };
        group.yield_current();
    } else {
        std::thread::yield_now();
    }
}

/// Suspend the calling fiber for at least `d`.
///
/// Returns `Err(Interrupted)` if another fiber interrupts the sleep,
/// `Err(Stopped)` if the fiber was asked to stop (before or during the
/// sleep), and `Ok(())` after the full duration otherwise.
pub fn sleep(d: Duration) -> FiberResult<()> {
    if !tls::in_fiber() {
        std::thread::sleep(d);
        return Ok(());
    }
    // Safety: in_fiber() implies a live group on this thread
    let group = unsafe { &*tls::current_group_ptr() };
    let ctrl = group.control()?;
    let id = tls::current_fiber();
    let slot = ctrl.table().slot(id.slot());

    if ctrl.stopping() || slot.stop_requested() {
        return Err(FiberError::Stopped);
    }
    if slot.take_interrupt() {
        return Err(FiberError::Interrupted);
    }
    if d.is_zero() {
        group.yield_current();
        return Ok(());
    }

    let waiter = Waiter::for_fiber(Arc::downgrade(&ctrl), id);
    slot.set_current_waiter(Some(Arc::clone(&waiter)));
    // Shutdown may have swept the slot before the waiter was visible;
    // claim our own wakeup rather than park unreachable
    if ctrl.stopping() && waiter.claim(WAKE_INTERRUPTED) {
        slot.set_current_waiter(None);
        return Err(FiberError::Stopped);
    }
    let w = Arc::clone(&waiter);
    let timer_id = ctrl.timer().schedule(
        Instant::now() + d,
        Box::new(move || {
            // For a sleep the timer firing is the success path
            if w.claim(WAKE_WOKEN) {
                w.deliver();
            }
        }),
    );

    group.block_current();
    slot.set_current_waiter(None);

    match waiter.reason() {
        WAKE_INTERRUPTED => {
            ctrl.timer().unschedule(timer_id);
            slot.clear_interrupt();
            if slot.stop_requested() || ctrl.stopping() {
                Err(FiberError::Stopped)
            } else {
                Err(FiberError::Interrupted)
            }
        }
        _ => Ok(()),
    }
}

/// Sleep in milliseconds.
pub fn sleep_ms(ms: u64) -> FiberResult<()> {
    sleep(Duration::from_millis(ms))
}

/// Sleep in microseconds.
pub fn sleep_us(us: u64) -> FiberResult<()> {
    sleep(Duration::from_micros(us))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_fallback() {
        // Not in fiber context: plain thread sleep and yield
        assert_eq!(current_fiber_id(), None);
        yield_now();
        let start = Instant::now();
        sleep(Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
