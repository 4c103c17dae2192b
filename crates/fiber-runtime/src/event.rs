//! Futex-like waitable event
//!
//! A `WaitableEvent` pairs a 32-bit atomic value with a waiter list.
//! `wait(expected)` blocks only if the value still equals `expected`
//! at registration time, checked under the list lock; this closes the
//! check-then-sleep race for every primitive built on top (mutexes,
//! condvars, joins, tokens).
//!
//! Waking is decoupled from the value: callers mutate `value()` with
//! plain atomics and then call a wake method. A fiber caller suspends
//! and yields its worker; any other thread parks itself. Each waiter
//! carries a claim word so exactly one of {waker, timer, interrupt}
//! wins the wakeup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use fiber_core::{FiberError, FiberId, FiberResult, SpinLock};

use crate::parking::ThreadParker;
use crate::task_control::TaskControl;
use crate::tls;

/// Wakeup reasons, raced for via [`Waiter::claim`].
pub(crate) const WAKE_PENDING: u32 = 0;
pub(crate) const WAKE_WOKEN: u32 = 1;
pub(crate) const WAKE_TIMEDOUT: u32 = 2;
pub(crate) const WAKE_INTERRUPTED: u32 = 3;

enum WaiterTarget {
    Fiber { ctrl: Weak<TaskControl>, id: FiberId },
    Thread { parker: Arc<ThreadParker> },
}

/// One registered wait. The `reason` word is the claim: whoever CASes
/// it from PENDING owns the wakeup and must call [`deliver`].
///
/// [`deliver`]: Waiter::deliver
pub(crate) struct Waiter {
    reason: AtomicU32,
    target: WaiterTarget,
}

impl Waiter {
    pub(crate) fn for_fiber(ctrl: Weak<TaskControl>, id: FiberId) -> Arc<Waiter> {
        Arc::new(Waiter {
            reason: AtomicU32::new(WAKE_PENDING),
            target: WaiterTarget::Fiber { ctrl, id },
        })
    }

    fn for_thread(parker: Arc<ThreadParker>) -> Arc<Waiter> {
        Arc::new(Waiter {
            reason: AtomicU32::new(WAKE_PENDING),
            target: WaiterTarget::Thread { parker },
        })
    }

    /// Try to own this wakeup. At most one claimer succeeds.
    pub(crate) fn claim(&self, reason: u32) -> bool {
        self.reason
            .compare_exchange(WAKE_PENDING, reason, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn reason(&self) -> u32 {
        self.reason.load(Ordering::Acquire)
    }

    /// Wake the target. Call only after a successful [`claim`].
    ///
    /// [`claim`]: Waiter::claim
    pub(crate) fn deliver(&self) {
        match &self.target {
            WaiterTarget::Fiber { ctrl, id } => {
                if let Some(ctrl) = ctrl.upgrade() {
                    ctrl.wake_fiber(*id);
                }
            }
            WaiterTarget::Thread { parker } => parker.unpark(),
        }
    }

    fn fiber_id(&self) -> FiberId {
        match &self.target {
            WaiterTarget::Fiber { id, .. } => *id,
            WaiterTarget::Thread { .. } => FiberId::NONE,
        }
    }
}

pub struct WaitableEvent {
    value: AtomicU32,
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl WaitableEvent {
    pub fn new(initial: u32) -> Self {
        WaitableEvent {
            value: AtomicU32::new(initial),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// The event word. Mutate with plain atomics, then call a wake
    /// method; wakes are never implied by value changes.
    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.value
    }

    /// Block until woken, unless the value no longer equals `expected`.
    ///
    /// Returns `Err(WouldBlock)` if the value already changed (no
    /// blocking occurred), `Err(TimedOut)` after `timeout`, and
    /// `Err(Interrupted)` if the waiting fiber was interrupted. A plain
    /// `Ok(())` only means "woken": callers re-check their predicate.
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> FiberResult<()> {
        if tls::in_fiber() {
            self.wait_in_fiber(expected, timeout)
        } else {
            self.wait_on_thread(expected, timeout)
        }
    }

    fn wait_in_fiber(&self, expected: u32, timeout: Option<Duration>) -> FiberResult<()> {
        // Safety: in_fiber() implies a live group published by this
        // worker thread
        let group = unsafe { &*tls::current_group_ptr() };
        let ctrl = group.control()?;
        let id = tls::current_fiber();
        let slot = ctrl.table().slot(id.slot());

        if ctrl.stopping() {
            return Err(FiberError::Stopped);
        }
        if slot.take_interrupt() {
            return Err(FiberError::Interrupted);
        }

        let waiter = Waiter::for_fiber(Arc::downgrade(&ctrl), id);
        {
            let mut waiters = self.waiters.lock();
            if self.value.load(Ordering::SeqCst) != expected {
                return Err(FiberError::WouldBlock);
            }
            waiters.push_back(Arc::clone(&waiter));
        }

        // Expose the waiter so interrupt()/stop() can claim it
        slot.set_current_waiter(Some(Arc::clone(&waiter)));

        // Shutdown may have swept the slot before the waiter was
        // visible; claim our own wakeup rather than park unreachable
        if ctrl.stopping() && waiter.claim(WAKE_INTERRUPTED) {
            slot.set_current_waiter(None);
            self.remove_waiter(&waiter);
            return Err(FiberError::Stopped);
        }

        let timer_id = timeout.map(|d| {
            let w = Arc::clone(&waiter);
            ctrl.timer().schedule(
                Instant::now() + d,
                Box::new(move || {
                    if w.claim(WAKE_TIMEDOUT) {
                        w.deliver();
                    }
                }),
            )
        });

        group.block_current();

        slot.set_current_waiter(None);
        if let Some(tid) = timer_id {
            ctrl.timer().unschedule(tid);
        }

        match waiter.reason() {
            WAKE_TIMEDOUT => {
                self.remove_waiter(&waiter);
                Err(FiberError::TimedOut)
            }
            WAKE_INTERRUPTED => {
                self.remove_waiter(&waiter);
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

    fn wait_on_thread(&self, expected: u32, timeout: Option<Duration>) -> FiberResult<()> {
        let parker = Arc::new(ThreadParker::new());
        let waiter = Waiter::for_thread(Arc::clone(&parker));
        {
            let mut waiters = self.waiters.lock();
            if self.value.load(Ordering::SeqCst) != expected {
                return Err(FiberError::WouldBlock);
            }
            waiters.push_back(Arc::clone(&waiter));
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            match waiter.reason() {
                WAKE_PENDING => {}
                WAKE_TIMEDOUT => return Err(FiberError::TimedOut),
                WAKE_INTERRUPTED => return Err(FiberError::Interrupted),
                _ => return Ok(()),
            }
            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        if waiter.claim(WAKE_TIMEDOUT) {
                            self.remove_waiter(&waiter);
                            return Err(FiberError::TimedOut);
                        }
                        // Lost to an in-flight waker; loop reads the
                        // winning reason
                        continue;
                    }
                    parker.park(Some(dl - now));
                }
                None => {
                    parker.park(None);
                }
            }
        }
    }

    /// Drop a registration that will never be woken (its claim is
    /// already decided), so dead entries do not pile up on events that
    /// see timeouts but no wakes.
    fn remove_waiter(&self, target: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, target)) {
            waiters.remove(pos);
        }
    }

    /// Wake one pending waiter. Returns the number woken (0 or 1).
    pub fn wake_one(&self) -> usize {
        loop {
            let waiter = self.waiters.lock().pop_front();
            match waiter {
                None => return 0,
                Some(w) => {
                    if w.claim(WAKE_WOKEN) {
                        w.deliver();
                        return 1;
                    }
                    // Already claimed by a timer or interrupt; skip
                }
            }
        }
    }

    /// Wake every pending waiter. Returns the number woken.
    pub fn wake_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).collect()
        };
        let mut woken = 0;
        for w in drained {
            if w.claim(WAKE_WOKEN) {
                w.deliver();
                woken += 1;
            }
        }
        woken
    }

    /// Wake every pending waiter except the given fiber, which stays
    /// registered. Used to hand a wakeup batch past a designated waiter.
    pub fn wake_except(&self, excluded: FiberId) -> usize {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            let mut kept = VecDeque::new();
            let mut out = Vec::new();
            for w in waiters.drain(..) {
                if excluded.is_some() && w.fiber_id() == excluded {
                    kept.push_back(w);
                } else {
                    out.push(w);
                }
            }
            *waiters = kept;
            out
        };
        let mut woken = 0;
        for w in drained {
            if w.claim(WAKE_WOKEN) {
                w.deliver();
                woken += 1;
            }
        }
        woken
    }

    /// Registered waiters, claimed or not. Stats only.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_would_block_on_changed_value() {
        let ev = WaitableEvent::new(7);
        assert_eq!(ev.wait(6, None), Err(FiberError::WouldBlock));
        assert_eq!(ev.waiter_count(), 0);
    }

    #[test]
    fn test_timeout() {
        let ev = WaitableEvent::new(0);
        let start = Instant::now();
        let r = ev.wait(0, Some(Duration::from_millis(50)));
        assert_eq!(r, Err(FiberError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_one_thread_waiter() {
        let ev = Arc::new(WaitableEvent::new(0));
        let ev2 = Arc::clone(&ev);
        let h = thread::spawn(move || ev2.wait(0, Some(Duration::from_secs(5))));
        // Wait for registration
        while ev.waiter_count() == 0 {
            thread::yield_now();
        }
        ev.value().store(1, Ordering::SeqCst);
        assert_eq!(ev.wake_one(), 1);
        assert_eq!(h.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_wake_all() {
        const N: usize = 4;
        let ev = Arc::new(WaitableEvent::new(0));
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..N {
            let ev = Arc::clone(&ev);
            let woken = Arc::clone(&woken);
            handles.push(thread::spawn(move || {
                if ev.wait(0, Some(Duration::from_secs(5))).is_ok() {
                    woken.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        while ev.waiter_count() < N {
            thread::yield_now();
        }
        ev.value().fetch_add(1, Ordering::SeqCst);
        assert_eq!(ev.wake_all(), N);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), N);
    }

    #[test]
    fn test_timed_out_waiter_leaves_the_list() {
        let ev = WaitableEvent::new(0);
        for _ in 0..3 {
            assert_eq!(
                ev.wait(0, Some(Duration::from_millis(10))),
                Err(FiberError::TimedOut)
            );
        }
        // Repeated timeouts on a never-woken event must not accumulate
        // dead registrations
        assert_eq!(ev.waiter_count(), 0);
    }

    #[test]
    fn test_wake_one_skips_timed_out_waiter() {
        let ev = Arc::new(WaitableEvent::new(0));
        let ev2 = Arc::clone(&ev);
        let h = thread::spawn(move || ev2.wait(0, Some(Duration::from_millis(20))));
        while ev.waiter_count() == 0 {
            thread::yield_now();
        }
        assert_eq!(h.join().unwrap(), Err(FiberError::TimedOut));
        // The stale registration must not absorb a wake
        assert_eq!(ev.wake_one(), 0);
    }
}
