//! Per-worker scheduling group
//!
//! Each worker OS thread owns one `TaskGroup`: a work-stealing run
//! queue for its own fibers, a spinlocked remote queue for cross-thread
//! submissions, and the saved scheduler context it switches back to
//! between fiber slices.
//!
//! Queue discipline: `rq` is single-owner (push/pop by the worker,
//! steal by anyone), `remote` is shared, `run_next` is a one-slot hint
//! that beats both so an urgent spawn runs on the very next slice.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fiber_core::constants::RUN_QUEUE_CAPACITY;
use fiber_core::{fdebug, ferror, FiberError, FiberId, FiberResult, FiberState, SpinLock};

use crate::arch::{self, ContextRegs};
use crate::fiber::{PARK_EMPTY, PARK_PARKED};
use crate::task_control::TaskControl;
use crate::tls;
use crate::wsq::WorkStealingQueue;

pub struct TaskGroup {
    index: usize,
    ctrl: Weak<TaskControl>,
    /// Owner deque of raw fiber ids
    rq: WorkStealingQueue,
    /// Cross-thread submissions land here
    remote: SpinLock<VecDeque<u64>>,
    /// One-slot urgent hint, 0 when empty
    run_next: AtomicU64,
    steal_seed: AtomicU64,
    /// Scheduler context for this worker; owner thread only
    sched_regs: UnsafeCell<ContextRegs>,
    nswitch: AtomicU64,
}

// Safety: sched_regs follows the owner-worker discipline; the queues
// handle their own synchronization.
unsafe impl Send for TaskGroup {}
unsafe impl Sync for TaskGroup {}

impl TaskGroup {
    pub(crate) fn new(index: usize, ctrl: Weak<TaskControl>) -> Arc<TaskGroup> {
        Arc::new(TaskGroup {
            index,
            ctrl,
            rq: WorkStealingQueue::new(RUN_QUEUE_CAPACITY),
            remote: SpinLock::new(VecDeque::new()),
            run_next: AtomicU64::new(0),
            steal_seed: AtomicU64::new(
                (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1,
            ),
            sched_regs: UnsafeCell::new(ContextRegs::zeroed()),
            nswitch: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn control(&self) -> FiberResult<Arc<TaskControl>> {
        self.ctrl.upgrade().ok_or(FiberError::NotInitialized)
    }

    pub fn switches(&self) -> u64 {
        self.nswitch.load(Ordering::Relaxed)
    }

    /// Queued fibers visible to this group (hint excluded). Approximate.
    pub fn queue_len(&self) -> usize {
        self.rq.len() + self.remote.lock().len()
    }

    /// Owner only: queue behind existing local work.
    pub(crate) fn enqueue_local(&self, id: FiberId) {
        if !self.rq.push(id.as_u64()) {
            self.remote.lock().push_back(id.as_u64());
        }
    }

    /// Any thread.
    pub(crate) fn push_remote(&self, id: FiberId) {
        self.remote.lock().push_back(id.as_u64());
    }

    /// Owner only: make `id` the next fiber this worker runs. A
    /// previously parked hint is demoted to the local queue.
    pub(crate) fn set_run_next(&self, id: FiberId) {
        let old = self.run_next.swap(id.as_u64(), Ordering::AcqRel);
        if old != 0 {
            self.enqueue_local(FiberId::from_raw(old));
        }
    }

    fn pop_remote(&self) -> Option<u64> {
        self.remote.lock().pop_front()
    }

    /// Owner only: hint, then local queue, then remote, then stealing.
    fn next_fiber(&self, ctrl: &Arc<TaskControl>) -> Option<FiberId> {
        let hint = self.run_next.swap(0, Ordering::AcqRel);
        if hint != 0 {
            return Some(FiberId::from_raw(hint));
        }
        if let Some(raw) = self.rq.pop() {
            return Some(FiberId::from_raw(raw));
        }
        if let Some(raw) = self.pop_remote() {
            return Some(FiberId::from_raw(raw));
        }
        self.steal(ctrl)
    }

    fn steal(&self, ctrl: &Arc<TaskControl>) -> Option<FiberId> {
        let ngroups = ctrl.ngroups();
        if ngroups <= 1 {
            return None;
        }
        let mut seed = self.steal_seed.load(Ordering::Relaxed);
        let mut found = None;
        for _ in 0..ngroups {
            // xorshift64
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let victim = seed as usize % ngroups;
            if victim == self.index {
                continue;
            }
            if let Some(victim) = ctrl.group(victim) {
                if let Some(raw) = victim.rq.steal().or_else(|| victim.pop_remote()) {
                    found = Some(FiberId::from_raw(raw));
                    break;
                }
            }
        }
        self.steal_seed.store(seed, Ordering::Relaxed);
        found
    }

    /// Switch into `id` and dispatch on the state it comes back in.
    fn run_fiber(&self, ctrl: &Arc<TaskControl>, id: FiberId) {
        let slot = ctrl.table().slot(id.slot());
        if slot.version() != id.version() {
            // Already cleaned up; a stale id drained from a queue
            return;
        }

        slot.set_state(FiberState::Running);
        tls::set_current_fiber(id);
        self.nswitch.fetch_add(1, Ordering::Relaxed);
        // Safety: this worker owns the fiber for the whole slice
        let fiber_regs = unsafe {
            let entity = slot.entity_mut();
            entity.nswitch += 1;
            &mut entity.regs as *mut ContextRegs
        };
        unsafe { arch::context_switch(self.sched_regs.get(), fiber_regs) };
        tls::clear_current_fiber();

        match slot.fiber_state() {
            FiberState::Ready => {
                // Voluntary yield; back of the local queue
                self.enqueue_local(id);
            }
            FiberState::Blocked => {
                // Context is saved; publish PARKED. A waker that beat us
                // here left NOTIFIED and counts on us to requeue.
                if slot
                    .park
                    .compare_exchange(
                        PARK_EMPTY,
                        PARK_PARKED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    slot.park.store(PARK_EMPTY, Ordering::Release);
                    slot.set_state(FiberState::Ready);
                    self.enqueue_local(id);
                }
            }
            FiberState::Finished => {
                ctrl.cleanup_fiber(id);
            }
            other => {
                ferror!("fiber {} returned to scheduler in state {:?}", id, other);
            }
        }
    }

    /// Called on a fiber stack: mark Blocked and switch to the
    /// scheduler. Returns when a waker requeues us and a worker
    /// switches back in.
    pub(crate) fn block_current(&self) {
        self.switch_out(FiberState::Blocked);
    }

    /// Called on a fiber stack: give up the slice, stay runnable.
    pub(crate) fn yield_current(&self) {
        self.switch_out(FiberState::Ready);
    }

    fn switch_out(&self, state: FiberState) {
        let id = tls::current_fiber();
        let ctrl = match self.ctrl.upgrade() {
            Some(c) => c,
            None => return,
        };
        let slot = ctrl.table().slot(id.slot());
        slot.set_state(state);
        // Safety: still the running fiber on this worker
        let fiber_regs = unsafe { &mut slot.entity_mut().regs as *mut ContextRegs };
        unsafe { arch::context_switch(fiber_regs, self.sched_regs.get()) };
    }

    /// Worker thread body.
    pub(crate) fn run_worker(group: Arc<TaskGroup>) {
        let ctrl = match group.ctrl.upgrade() {
            Some(c) => c,
            None => return,
        };
        tls::set_current_group(Arc::as_ptr(&group));
        fiber_core::flog::set_log_worker(group.index as u32);
        fdebug!("worker {} running", group.index);

        let spin_limit = ctrl.config().idle_spins;
        let park_timeout = ctrl.config().park_timeout;
        let mut idle = 0u32;
        loop {
            // Epoch read must precede the queue checks: a signal after
            // this point bumps the epoch and the park below returns
            // immediately instead of missing it
            let epoch = ctrl.park_epoch();
            if let Some(id) = group.next_fiber(&ctrl) {
                idle = 0;
                group.run_fiber(&ctrl, id);
                continue;
            }
            // Exit only after the stop sweep has requeued all blocked
            // fibers, or a sleeper woken by shutdown could be stranded
            // in a queue no worker drains
            if ctrl.stopping() && ctrl.stop_drained() {
                break;
            }
            if idle < spin_limit {
                idle += 1;
                std::hint::spin_loop();
                std::thread::yield_now();
            } else {
                ctrl.park_worker(epoch, park_timeout);
                idle = 0;
            }
        }

        fdebug!(
            "worker {} exiting after {} switches",
            group.index,
            group.nswitch.load(Ordering::Relaxed)
        );
        tls::clear_current_group();
        fiber_core::flog::clear_log_worker();
    }
}

/// Landing point when a fiber's entry function returns. Runs on the
/// fiber stack; switches to the scheduler and never comes back.
pub(crate) extern "C" fn fiber_finish_hook() {
    let group_ptr = tls::current_group_ptr();
    if !group_ptr.is_null() {
        let group = unsafe { &*group_ptr };
        if let Ok(ctrl) = group.control() {
            let id = tls::current_fiber();
            let slot = ctrl.table().slot(id.slot());
            slot.set_state(FiberState::Finished);
            // Safety: final switch-out of this fiber
            let fiber_regs = unsafe { &mut slot.entity_mut().regs as *mut ContextRegs };
            unsafe { arch::context_switch(fiber_regs, group.sched_regs.get()) };
        }
    }
    unreachable!("finished fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;

    // Queue mechanics that do not need live workers; scheduling end to
    // end is covered by the facade crate's integration tests.

    #[test]
    fn test_run_next_demotes_old_hint() {
        let group = TaskGroup::new(0, Weak::new());
        let a = FiberId::new(1, 1);
        let b = FiberId::new(2, 1);
        group.set_run_next(a);
        group.set_run_next(b);
        assert_eq!(group.run_next.load(Ordering::Relaxed), b.as_u64());
        // The demoted hint must still be queued
        assert_eq!(group.rq.pop(), Some(a.as_u64()));
    }

    #[test]
    fn test_remote_fifo() {
        let group = TaskGroup::new(0, Weak::new());
        group.push_remote(FiberId::new(1, 1));
        group.push_remote(FiberId::new(2, 1));
        assert_eq!(group.pop_remote(), Some(FiberId::new(1, 1).as_u64()));
        assert_eq!(group.pop_remote(), Some(FiberId::new(2, 1).as_u64()));
        assert_eq!(group.pop_remote(), None);
    }

    #[test]
    fn test_local_overflow_spills_to_remote() {
        let group = TaskGroup::new(0, Weak::new());
        for i in 0..RUN_QUEUE_CAPACITY as u32 + 10 {
            group.enqueue_local(FiberId::new(i, 1));
        }
        assert_eq!(group.rq.len(), RUN_QUEUE_CAPACITY);
        assert_eq!(group.remote.lock().len(), 10);
    }
}
