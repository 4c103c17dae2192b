//! Process-wide scheduler control
//!
//! A `TaskControl` owns everything the workers share: the fiber slot
//! table, stack pools, the timer thread, the parking event idle
//! workers sleep on, and the group array itself. Groups are appended
//! under a lock but read lock-free: the array is fixed-size, slots are
//! `OnceLock`, and `ngroup` only grows.
//!
//! A process normally uses the [`global`] instance, but independent
//! instances coexist fine (each has its own workers and slot table),
//! which is what the integration tests do.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use fiber_core::constants::MAX_WORKERS;
use fiber_core::{
    ferror, finfo, fwarn, FiberAttr, FiberError, FiberId, FiberResult, FiberState, SpinLock,
    StackClass,
};

use crate::arch;
use crate::config::SchedConfig;
use crate::event::{WaitableEvent, WAKE_INTERRUPTED};
use crate::fiber::{FiberTable, PARK_EMPTY, PARK_NOTIFIED, PARK_PARKED};
use crate::stack::StackPools;
use crate::task_group::TaskGroup;
use crate::timer::TimerThread;
use crate::tls;

/// Scheduler-wide counters, sampled racily.
#[derive(Debug, Clone, Copy)]
pub struct SchedStats {
    pub workers: usize,
    pub live_fibers: u32,
    pub spawned: u64,
    pub finished: u64,
    pub cached_stacks: usize,
    pub timers_fired: u64,
}

pub struct TaskControl {
    config: SchedConfig,
    table: FiberTable,
    stacks: StackPools,
    timer: TimerThread,
    groups: Box<[OnceLock<Arc<TaskGroup>>]>,
    ngroup: AtomicUsize,
    /// Idle workers wait here; the value is a wakeup epoch
    parking: WaitableEvent,
    nosignal_pending: AtomicUsize,
    round_robin: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    /// Set once the stop sweep has requeued every blocked fiber;
    /// workers may only exit after this
    stop_drained: AtomicBool,
    workers: SpinLock<Vec<JoinHandle<()>>>,
    nspawned: AtomicU64,
    nfinished: AtomicU64,
}

impl TaskControl {
    pub fn new(config: SchedConfig) -> FiberResult<Arc<TaskControl>> {
        config.validate()?;
        fiber_core::flog::init();
        let groups = (0..MAX_WORKERS).map(|_| OnceLock::new()).collect();
        Ok(Arc::new(TaskControl {
            table: FiberTable::new(config.max_fibers),
            stacks: StackPools::new(config.stack_pool_capacity),
            timer: TimerThread::new(config.timer_buckets),
            groups,
            ngroup: AtomicUsize::new(0),
            parking: WaitableEvent::new(0),
            nosignal_pending: AtomicUsize::new(0),
            round_robin: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop_drained: AtomicBool::new(false),
            workers: SpinLock::new(Vec::new()),
            nspawned: AtomicU64::new(0),
            nfinished: AtomicU64::new(0),
            config,
        }))
    }

    /// Start the timer thread and the initial workers. Callable once.
    pub fn start(self: &Arc<Self>) -> FiberResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FiberError::AlreadyInitialized);
        }
        self.timer.start()?;
        let added = self.add_workers(self.config.num_workers)?;
        if added == 0 {
            return Err(FiberError::NoResource);
        }
        finfo!(
            "scheduler started: {} workers, {} fiber slots",
            added,
            self.table.capacity()
        );
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn table(&self) -> &FiberTable {
        &self.table
    }

    #[inline]
    pub(crate) fn timer(&self) -> &TimerThread {
        &self.timer
    }

    /// Public timer surface: run `callback` at `run_at`.
    pub fn timer_add(
        &self,
        run_at: std::time::Instant,
        callback: crate::timer::TimerCallback,
    ) -> fiber_core::TimerId {
        self.timer.schedule(run_at, callback)
    }

    /// Cancel a timer scheduled through [`timer_add`](Self::timer_add).
    pub fn timer_del(&self, id: fiber_core::TimerId) -> crate::timer::Unschedule {
        self.timer.unschedule(id)
    }

    #[inline]
    pub fn ngroups(&self) -> usize {
        self.ngroup.load(Ordering::Acquire)
    }

    pub(crate) fn group(&self, idx: usize) -> Option<&Arc<TaskGroup>> {
        self.groups.get(idx)?.get()
    }

    #[inline]
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn stop_drained(&self) -> bool {
        self.stop_drained.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            workers: self.ngroups(),
            live_fibers: self.table.live(),
            spawned: self.nspawned.load(Ordering::Relaxed),
            finished: self.nfinished.load(Ordering::Relaxed),
            cached_stacks: self.stacks.cached(),
            timers_fired: self.timer.fired(),
        }
    }

    // ---- worker parking ----

    /// Epoch for the park protocol: read it before the final queue
    /// check, pass it to [`park_worker`](Self::park_worker).
    pub(crate) fn park_epoch(&self) -> u32 {
        self.parking.value().load(Ordering::SeqCst)
    }

    pub(crate) fn park_worker(&self, epoch: u32, timeout: Duration) {
        let _ = self.parking.wait(epoch, Some(timeout));
    }

    /// Bump the epoch and release up to `n` parked workers.
    pub(crate) fn signal_workers(&self, n: usize) {
        self.parking.value().fetch_add(1, Ordering::SeqCst);
        for _ in 0..n {
            if self.parking.wake_one() == 0 {
                break;
            }
        }
    }

    // ---- spawning ----

    /// Create a fiber and queue it behind existing work.
    pub fn spawn(
        self: &Arc<Self>,
        attr: FiberAttr,
        f: impl FnOnce() + Send + 'static,
    ) -> FiberResult<FiberId> {
        self.spawn_inner(attr, Box::new(f), false)
    }

    /// Create a fiber that preempts the caller's worker: when spawned
    /// from a fiber, the new fiber runs next and the caller yields.
    pub fn spawn_urgent(
        self: &Arc<Self>,
        attr: FiberAttr,
        f: impl FnOnce() + Send + 'static,
    ) -> FiberResult<FiberId> {
        self.spawn_inner(attr, Box::new(f), true)
    }

    fn spawn_inner(
        self: &Arc<Self>,
        attr: FiberAttr,
        f: Box<dyn FnOnce() + Send>,
        urgent: bool,
    ) -> FiberResult<FiberId> {
        if self.stopping() {
            return Err(FiberError::Stopped);
        }
        if self.ngroups() == 0 {
            return Err(FiberError::NotInitialized);
        }
        if attr.stack_class == StackClass::Pthread {
            return self.spawn_pthread(attr, f);
        }

        let idx = self.table.acquire()?;
        let slot = self.table.slot(idx);
        let stack = match self.stacks.acquire(attr.stack_class) {
            Ok(s) => s,
            Err(e) => {
                self.table.release(idx);
                return Err(e);
            }
        };
        let id = FiberId::new(idx, slot.version());
        slot.set_never_quit(attr.never_quit);
        // Safety: the slot is not yet visible to any queue
        unsafe {
            let entity = slot.entity_mut();
            entity.attr = attr;
            entity.nswitch = 0;
            entity.fls = None;
            let top = stack.top();
            entity.stack = Some(stack);
            let arg = Box::into_raw(Box::new(f)) as usize;
            arch::init_context(&mut entity.regs, top, fiber_entry as usize, arg);
        }
        slot.set_state(FiberState::Ready);
        self.nspawned.fetch_add(1, Ordering::Relaxed);
        self.dispatch(id, urgent, attr.no_signal);
        Ok(id)
    }

    /// Pthread-mode fiber: the body runs on its own OS thread, but
    /// keeps a slot so the id supports join/interrupt/stop uniformly.
    fn spawn_pthread(
        self: &Arc<Self>,
        attr: FiberAttr,
        f: Box<dyn FnOnce() + Send>,
    ) -> FiberResult<FiberId> {
        let idx = self.table.acquire()?;
        let slot = self.table.slot(idx);
        slot.set_never_quit(attr.never_quit);
        slot.set_state(FiberState::Running);
        let id = FiberId::new(idx, slot.version());
        let ctrl = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("fiber-pthread-{}", idx))
            .spawn(move || {
                run_entry(f);
                ctrl.finish_slot(idx);
            });
        if spawned.is_err() {
            self.table.release(idx);
            return Err(FiberError::NoResource);
        }
        self.nspawned.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn dispatch(self: &Arc<Self>, id: FiberId, urgent: bool, no_signal: bool) {
        let group_ptr = tls::current_group_ptr();
        if !group_ptr.is_null() {
            // Safety: non-null means this thread is a live worker
            let group = unsafe { &*group_ptr };
            if group
                .control()
                .map_or(false, |c| std::ptr::eq(Arc::as_ptr(&c), Arc::as_ptr(self)))
            {
                if urgent && tls::in_fiber() {
                    group.set_run_next(id);
                    group.yield_current();
                } else {
                    group.enqueue_local(id);
                    if !no_signal {
                        self.signal_workers(1);
                    } else {
                        self.nosignal_pending.fetch_add(1, Ordering::AcqRel);
                    }
                }
                return;
            }
        }
        let victim = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.ngroups();
        if let Some(group) = self.group(victim) {
            group.push_remote(id);
        }
        if no_signal {
            self.nosignal_pending.fetch_add(1, Ordering::AcqRel);
        } else {
            self.signal_workers(1);
        }
    }

    /// Wake workers for fibers spawned with `no_signal`. Returns the
    /// number of deferred signals flushed.
    pub fn flush_nosignal(&self) -> usize {
        let n = self.nosignal_pending.swap(0, Ordering::AcqRel);
        if n > 0 {
            self.signal_workers(n);
        }
        n
    }

    // ---- lifecycle operations ----

    /// True while the id refers to a live fiber.
    pub fn fiber_exists(&self, id: FiberId) -> bool {
        self.table.get(id).is_some()
    }

    /// Block until the fiber finishes. Joining an already-dead id
    /// succeeds immediately; joining self is refused.
    pub fn join(&self, id: FiberId) -> FiberResult<()> {
        if id.is_none() || !self.table.in_range(id) {
            return Err(FiberError::StaleHandle);
        }
        if tls::in_fiber() && tls::current_fiber() == id {
            return Err(FiberError::Permission);
        }
        let slot = self.table.slot(id.slot());
        loop {
            // The join event's value tracks the slot version; any other
            // value means the fiber this id named is gone
            let current = slot.join_event.value().load(Ordering::SeqCst);
            if current != id.version() {
                return Ok(());
            }
            match slot.join_event.wait(current, None) {
                Ok(()) | Err(FiberError::WouldBlock) | Err(FiberError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Make the fiber's current (or next) blocking call return
    /// `Interrupted`. Delivered at most once per call.
    pub fn interrupt(&self, id: FiberId) -> FiberResult<()> {
        let slot = self.table.get(id).ok_or(FiberError::StaleHandle)?;
        if slot.is_never_quit() {
            return Err(FiberError::Permission);
        }
        slot.set_interrupt();
        if let Some(waiter) = slot.current_waiter() {
            if waiter.claim(WAKE_INTERRUPTED) {
                waiter.deliver();
            }
        }
        Ok(())
    }

    /// Ask the fiber to unwind: sets the stop flag, then interrupts.
    /// Sleeps in a stopped fiber return `Stopped` instead of running
    /// their full duration.
    pub fn stop_fiber(&self, id: FiberId) -> FiberResult<()> {
        {
            let slot = self.table.get(id).ok_or(FiberError::StaleHandle)?;
            if slot.is_never_quit() {
                return Err(FiberError::Permission);
            }
            slot.request_stop();
        }
        self.interrupt(id)
    }

    /// Whether stop was requested for the calling fiber.
    pub fn stop_requested(&self, id: FiberId) -> bool {
        self.table.get(id).map_or(false, |s| s.stop_requested())
    }

    // ---- wakeup plumbing ----

    /// Requeue a blocked fiber. Races the worker that is still saving
    /// the fiber's context via the park token: exactly one side queues.
    pub(crate) fn wake_fiber(&self, id: FiberId) {
        let slot = match self.table.get(id) {
            Some(s) => s,
            None => return,
        };
        loop {
            match slot.park.load(Ordering::Acquire) {
                PARK_PARKED => {
                    if slot
                        .park
                        .compare_exchange(
                            PARK_PARKED,
                            PARK_EMPTY,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        slot.set_state(FiberState::Ready);
                        self.enqueue_ready(id);
                        return;
                    }
                }
                PARK_EMPTY => {
                    // The owning worker has not finished the context
                    // save; leave a note and let it requeue
                    if slot
                        .park
                        .compare_exchange(
                            PARK_EMPTY,
                            PARK_NOTIFIED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn enqueue_ready(&self, id: FiberId) {
        let group_ptr = tls::current_group_ptr();
        if !group_ptr.is_null() {
            // Safety: non-null means this thread is a live worker
            let group = unsafe { &*group_ptr };
            if group
                .control()
                .map_or(false, |c| std::ptr::eq(Arc::as_ptr(&c), self))
            {
                group.enqueue_local(id);
                self.signal_workers(1);
                return;
            }
        }
        let victim = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.ngroups().max(1);
        if let Some(group) = self.group(victim) {
            group.push_remote(id);
        }
        self.signal_workers(1);
    }

    /// Tear down a finished fiber: drop FLS, pool the stack, retire the
    /// slot. Worker only.
    pub(crate) fn cleanup_fiber(&self, id: FiberId) {
        let slot = self.table.slot(id.slot());
        // Safety: the fiber is finished; this worker is the last owner
        unsafe {
            let entity = slot.entity_mut();
            entity.fls = None;
            if let Some(stack) = entity.stack.take() {
                self.stacks.release(stack);
            }
        }
        self.finish_slot(id.slot());
    }

    fn finish_slot(&self, idx: u32) {
        let slot = self.table.slot(idx);
        slot.clear_interrupt();
        slot.clear_stop();
        slot.set_never_quit(false);
        slot.set_current_waiter(None);
        self.table.release(idx);
        self.nfinished.fetch_add(1, Ordering::Relaxed);
    }

    // ---- worker management ----

    /// Add worker threads under load. Returns how many were added
    /// (clamped by the worker cap).
    pub fn add_workers(self: &Arc<Self>, extra: usize) -> FiberResult<usize> {
        let mut workers = self.workers.lock();
        let mut added = 0;
        for _ in 0..extra {
            let idx = self.ngroup.load(Ordering::Relaxed);
            if idx >= self.groups.len() {
                fwarn!("worker cap {} reached, not adding more", self.groups.len());
                break;
            }
            let group = TaskGroup::new(idx, Arc::downgrade(self));
            if self.groups[idx].set(Arc::clone(&group)).is_err() {
                ferror!("group slot {} already taken", idx);
                return Err(FiberError::AlreadyInitialized);
            }
            // Publish before the thread starts so stealers can see it
            self.ngroup.store(idx + 1, Ordering::Release);
            let spawned = std::thread::Builder::new()
                .name(format!("fiber-worker-{}", idx))
                .spawn(move || TaskGroup::run_worker(group));
            match spawned {
                Ok(h) => workers.push(h),
                Err(e) => {
                    // The group stays; its queue drains through steals
                    ferror!("failed to spawn worker {}: {}", idx, e);
                    return Err(FiberError::NoResource);
                }
            }
            added += 1;
        }
        Ok(added)
    }

    /// Stop workers and the timer thread, then join them. Blocks, so
    /// never call from a fiber. Idempotent.
    ///
    /// Fibers blocked in a sleep or a timed wait when this runs are
    /// woken and see `Stopped` from their blocking call, so they get a
    /// chance to unwind before the workers go away.
    pub fn stop_and_join(&self) {
        debug_assert!(!tls::in_fiber(), "stop_and_join would join its own worker");
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        finfo!("scheduler stopping");
        self.sweep_blocked();
        // Workers keep draining until the sweep's requeues are
        // published; only then may they exit on an empty queue
        self.stop_drained.store(true, Ordering::Release);
        self.parking.value().fetch_add(1, Ordering::SeqCst);
        self.parking.wake_all();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
        self.timer.stop_and_join();
        finfo!(
            "scheduler stopped: {} spawned, {} finished",
            self.nspawned.load(Ordering::Relaxed),
            self.nfinished.load(Ordering::Relaxed)
        );
    }

    /// Shutdown sweep: mark every slot stopped and claim any waiter a
    /// fiber is blocked on, requeueing it so its blocking call returns
    /// `Stopped`. Claiming a free slot's leftover waiter is harmless;
    /// the claim CAS fails on anything already woken.
    fn sweep_blocked(&self) {
        for idx in 0..self.table.capacity() as u32 {
            let slot = self.table.slot(idx);
            slot.request_stop();
            if let Some(waiter) = slot.current_waiter() {
                if waiter.claim(WAKE_INTERRUPTED) {
                    waiter.deliver();
                }
            }
        }
    }
}

/// Entry shim every fiber starts in. Unboxes the closure passed through
/// the context registers and contains panics to the fiber.
extern "C" fn fiber_entry(raw: usize) {
    // Safety: raw came from Box::into_raw in spawn_inner
    let f = unsafe { Box::from_raw(raw as *mut Box<dyn FnOnce() + Send>) };
    run_entry(*f);
}

fn run_entry(f: Box<dyn FnOnce() + Send>) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        ferror!("fiber {} panicked", tls::current_fiber());
    }
}

// ---- global instance ----

static GLOBAL: OnceLock<Arc<TaskControl>> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

/// Initialize the process-wide scheduler with an explicit config.
/// Fails if something already initialized it.
pub fn global_init(config: SchedConfig) -> FiberResult<Arc<TaskControl>> {
    let _guard = GLOBAL_INIT.lock().unwrap();
    if GLOBAL.get().is_some() {
        return Err(FiberError::AlreadyInitialized);
    }
    let ctrl = TaskControl::new(config)?;
    ctrl.start()?;
    let _ = GLOBAL.set(Arc::clone(&ctrl));
    Ok(ctrl)
}

/// The process-wide scheduler, started on first use with
/// [`SchedConfig::from_env`].
pub fn global() -> FiberResult<Arc<TaskControl>> {
    if let Some(ctrl) = GLOBAL.get() {
        return Ok(Arc::clone(ctrl));
    }
    let _guard = GLOBAL_INIT.lock().unwrap();
    if let Some(ctrl) = GLOBAL.get() {
        return Ok(Arc::clone(ctrl));
    }
    let ctrl = TaskControl::new(SchedConfig::from_env())?;
    ctrl.start()?;
    let _ = GLOBAL.set(Arc::clone(&ctrl));
    Ok(ctrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Arc<TaskControl> {
        let ctrl = TaskControl::new(
            SchedConfig::default()
                .with_num_workers(2)
                .with_max_fibers(64)
                .with_park_timeout(Duration::from_millis(10)),
        )
        .unwrap();
        ctrl.start().unwrap();
        ctrl
    }

    #[test]
    fn test_start_once() {
        let ctrl = small();
        assert_eq!(ctrl.start().unwrap_err(), FiberError::AlreadyInitialized);
        assert_eq!(ctrl.ngroups(), 2);
        ctrl.stop_and_join();
    }

    #[test]
    fn test_spawn_before_start_fails() {
        let ctrl = TaskControl::new(SchedConfig::default().with_num_workers(1)).unwrap();
        let r = ctrl.spawn(FiberAttr::new(), || {});
        assert_eq!(r.unwrap_err(), FiberError::NotInitialized);
    }

    #[test]
    fn test_spawn_and_join() {
        let ctrl = small();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let id = ctrl
            .spawn(FiberAttr::new(), move || {
                f.store(true, Ordering::SeqCst);
            })
            .unwrap();
        ctrl.join(id).unwrap();
        assert!(flag.load(Ordering::SeqCst));
        // Joining again succeeds immediately: the id is stale-dead
        ctrl.join(id).unwrap();
        assert!(!ctrl.fiber_exists(id));
        ctrl.stop_and_join();
    }

    #[test]
    fn test_spawn_after_stop_fails() {
        let ctrl = small();
        ctrl.stop_and_join();
        assert_eq!(
            ctrl.spawn(FiberAttr::new(), || {}).unwrap_err(),
            FiberError::Stopped
        );
    }

    #[test]
    fn test_interrupt_stale_id() {
        let ctrl = small();
        let id = ctrl.spawn(FiberAttr::new(), || {}).unwrap();
        ctrl.join(id).unwrap();
        assert_eq!(ctrl.interrupt(id).unwrap_err(), FiberError::StaleHandle);
        ctrl.stop_and_join();
    }

    #[test]
    fn test_never_quit_refuses_stop() {
        let ctrl = small();
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        let id = ctrl
            .spawn(FiberAttr::new().never_quit(), move || {
                while !g.load(Ordering::SeqCst) {
                    crate::sleep::yield_now();
                }
            })
            .unwrap();
        // The fiber may or may not have started; the attr is on the slot
        assert_eq!(ctrl.stop_fiber(id).unwrap_err(), FiberError::Permission);
        assert_eq!(ctrl.interrupt(id).unwrap_err(), FiberError::Permission);
        gate.store(true, Ordering::SeqCst);
        ctrl.join(id).unwrap();
        ctrl.stop_and_join();
    }

    #[test]
    fn test_stop_and_join_wakes_blocked_sleeper() {
        let ctrl = small();
        let (tx, rx) = std::sync::mpsc::channel();
        ctrl.spawn(FiberAttr::new(), move || {
            tx.send(crate::sleep::sleep(Duration::from_secs(30))).unwrap();
        })
        .unwrap();
        // Let the fiber reach its sleep
        std::thread::sleep(Duration::from_millis(50));
        let begun = std::time::Instant::now();
        ctrl.stop_and_join();
        assert!(begun.elapsed() < Duration::from_secs(5));
        // The sleeper was woken, saw the stop, and finished
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(FiberError::Stopped)
        );
        assert_eq!(ctrl.stats().live_fibers, 0);
    }

    #[test]
    fn test_pthread_mode_join() {
        let ctrl = small();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let id = ctrl
            .spawn(
                FiberAttr::new().with_stack_class(StackClass::Pthread),
                move || {
                    f.store(true, Ordering::SeqCst);
                },
            )
            .unwrap();
        ctrl.join(id).unwrap();
        assert!(flag.load(Ordering::SeqCst));
        ctrl.stop_and_join();
    }

    #[test]
    fn test_add_workers() {
        let ctrl = small();
        assert_eq!(ctrl.ngroups(), 2);
        let added = ctrl.add_workers(2).unwrap();
        assert_eq!(added, 2);
        assert_eq!(ctrl.ngroups(), 4);
        ctrl.stop_and_join();
    }

    #[test]
    fn test_slot_exhaustion_reports_no_resource() {
        let ctrl = TaskControl::new(
            SchedConfig::default()
                .with_num_workers(1)
                .with_max_fibers(4)
                .with_park_timeout(Duration::from_millis(10)),
        )
        .unwrap();
        ctrl.start().unwrap();
        let gate = Arc::new(AtomicBool::new(false));
        let mut ids = vec![];
        for _ in 0..4 {
            let g = Arc::clone(&gate);
            ids.push(
                ctrl.spawn(FiberAttr::new(), move || {
                    while !g.load(Ordering::SeqCst) {
                        crate::sleep::yield_now();
                    }
                })
                .unwrap(),
            );
        }
        assert_eq!(
            ctrl.spawn(FiberAttr::new(), || {}).unwrap_err(),
            FiberError::NoResource
        );
        gate.store(true, Ordering::SeqCst);
        for id in ids {
            ctrl.join(id).unwrap();
        }
        // Slots freed; spawning works again
        let id = ctrl.spawn(FiberAttr::new(), || {}).unwrap();
        ctrl.join(id).unwrap();
        ctrl.stop_and_join();
    }
}
