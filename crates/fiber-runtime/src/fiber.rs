//! Fiber slot table
//!
//! Fibers live in a fixed slot table allocated at scheduler startup.
//! Each slot is reused across fiber lifetimes; a per-slot version
//! counter, bumped at every cleanup, stales old `FiberId`s.
//!
//! Slot fields split by access pattern:
//! - atomics (`state`, `park`, flags) are touched from any thread
//! - `entity` (registers, stack, FLS) is only touched by the worker
//!   currently running or cleaning up the fiber, through `UnsafeCell`

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use fiber_core::{FiberAttr, FiberError, FiberId, FiberResult, FiberState, SpinLock};

use crate::arch::ContextRegs;
use crate::event::{Waiter, WaitableEvent};
use crate::fls::FlsTable;
use crate::stack::Stack;

/// Park token handshake between a blocking fiber's worker and its
/// waker. The worker publishes PARKED after the context save; a waker
/// arriving earlier leaves NOTIFIED so the wakeup is never lost.
pub(crate) const PARK_EMPTY: u32 = 0;
pub(crate) const PARK_PARKED: u32 = 1;
pub(crate) const PARK_NOTIFIED: u32 = 2;

/// Worker-private fiber state. Only the worker running (or cleaning
/// up) the fiber may touch this.
pub(crate) struct FiberEntity {
    pub regs: ContextRegs,
    pub stack: Option<Stack>,
    pub attr: FiberAttr,
    pub fls: Option<FlsTable>,
    /// Times this fiber has been scheduled in
    pub nswitch: u64,
}

impl FiberEntity {
    fn new() -> Self {
        FiberEntity {
            regs: ContextRegs::zeroed(),
            stack: None,
            attr: FiberAttr::new(),
            fls: None,
            nswitch: 0,
        }
    }
}

pub(crate) struct FiberSlot {
    /// Live version; a FiberId is valid while its version matches
    version: AtomicU32,
    pub state: AtomicU8,
    pub park: AtomicU32,
    stop: AtomicBool,
    interrupted: AtomicBool,
    never_quit: AtomicBool,
    /// Joiners wait here for the value (the version) to move past
    /// their id's version
    pub join_event: WaitableEvent,
    /// The waiter the fiber is currently blocked on, if any; lets
    /// interrupt() claim an in-flight wait
    current_waiter: SpinLock<Option<Arc<Waiter>>>,
    entity: UnsafeCell<FiberEntity>,
}

// Safety: entity is guarded by the owner-worker discipline above;
// everything else is atomic or locked.
unsafe impl Send for FiberSlot {}
unsafe impl Sync for FiberSlot {}

impl FiberSlot {
    fn new() -> Self {
        FiberSlot {
            version: AtomicU32::new(1),
            state: AtomicU8::new(FiberState::Created as u8),
            park: AtomicU32::new(PARK_EMPTY),
            stop: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            never_quit: AtomicBool::new(false),
            join_event: WaitableEvent::new(1),
            current_waiter: SpinLock::new(None),
            entity: UnsafeCell::new(FiberEntity::new()),
        }
    }

    #[inline]
    pub(crate) fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn fiber_state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consume a pending interrupt.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub(crate) fn set_never_quit(&self, v: bool) {
        self.never_quit.store(v, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_never_quit(&self) -> bool {
        self.never_quit.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_waiter(&self, w: Option<Arc<Waiter>>) {
        *self.current_waiter.lock() = w;
    }

    pub(crate) fn current_waiter(&self) -> Option<Arc<Waiter>> {
        self.current_waiter.lock().clone()
    }

    /// # Safety
    ///
    /// Caller must be the worker that owns this fiber right now, or
    /// hold the slot before it is published to any queue.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn entity_mut(&self) -> &mut FiberEntity {
        &mut *self.entity.get()
    }
}

pub(crate) struct FiberTable {
    slots: Box<[FiberSlot]>,
    free: SpinLock<Vec<u32>>,
    next_fresh: AtomicU32,
    live: AtomicU32,
}

impl FiberTable {
    pub(crate) fn new(max_fibers: usize) -> Self {
        let slots = (0..max_fibers).map(|_| FiberSlot::new()).collect();
        FiberTable {
            slots,
            free: SpinLock::new(Vec::new()),
            next_fresh: AtomicU32::new(0),
            live: AtomicU32::new(0),
        }
    }

    /// Take a slot for a new fiber. The slot's current version becomes
    /// the id's version.
    pub(crate) fn acquire(&self) -> FiberResult<u32> {
        let idx = match self.free.lock().pop() {
            Some(idx) => idx,
            None => {
                let idx = self.next_fresh.fetch_add(1, Ordering::Relaxed);
                if idx as usize >= self.slots.len() {
                    // Leave the counter saturated; reuse comes from the
                    // free list from here on
                    self.next_fresh
                        .store(self.slots.len() as u32, Ordering::Relaxed);
                    return Err(FiberError::NoResource);
                }
                idx
            }
        };
        let slot = &self.slots[idx as usize];
        slot.set_state(FiberState::Created);
        slot.park.store(PARK_EMPTY, Ordering::Release);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(idx)
    }

    /// Retire a finished fiber: bump the version (staling its id) and
    /// release its joiners.
    pub(crate) fn release(&self, idx: u32) {
        let slot = &self.slots[idx as usize];
        let new_version = slot.version.fetch_add(1, Ordering::AcqRel) + 1;
        slot.join_event.value().store(new_version, Ordering::SeqCst);
        slot.join_event.wake_all();
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(idx);
    }

    /// Slot by index. Panics on out-of-range; internal ids are always
    /// in range.
    #[inline]
    pub(crate) fn slot(&self, idx: u32) -> &FiberSlot {
        &self.slots[idx as usize]
    }

    /// Slot for an id, only while the id is current.
    pub(crate) fn get(&self, id: FiberId) -> Option<&FiberSlot> {
        let slot = self.slots.get(id.slot() as usize)?;
        if slot.version() == id.version() {
            Some(slot)
        } else {
            None
        }
    }

    pub(crate) fn in_range(&self, id: FiberId) -> bool {
        (id.slot() as usize) < self.slots.len()
    }

    pub(crate) fn live(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_versions() {
        let table = FiberTable::new(4);
        let idx = table.acquire().unwrap();
        let v1 = table.slot(idx).version();
        let id = FiberId::new(idx, v1);
        assert!(table.get(id).is_some());

        table.release(idx);
        assert!(table.get(id).is_none(), "released id must be stale");

        // Reuse bumps the version
        let idx2 = table.acquire().unwrap();
        assert_eq!(idx2, idx);
        assert_eq!(table.slot(idx2).version(), v1 + 1);
    }

    #[test]
    fn test_exhaustion() {
        let table = FiberTable::new(2);
        let a = table.acquire().unwrap();
        let _b = table.acquire().unwrap();
        assert_eq!(table.acquire(), Err(FiberError::NoResource));
        assert_eq!(table.live(), 2);

        table.release(a);
        assert!(table.acquire().is_ok());
    }

    #[test]
    fn test_join_event_tracks_version() {
        let table = FiberTable::new(1);
        let idx = table.acquire().unwrap();
        let ver = table.slot(idx).version();
        assert_eq!(
            table.slot(idx).join_event.value().load(Ordering::SeqCst),
            ver
        );
        table.release(idx);
        assert_eq!(
            table.slot(idx).join_event.value().load(Ordering::SeqCst),
            ver + 1
        );
    }

    #[test]
    fn test_interrupt_flag_consumed_once() {
        let table = FiberTable::new(1);
        let idx = table.acquire().unwrap();
        let slot = table.slot(idx);
        slot.set_interrupt();
        assert!(slot.take_interrupt());
        assert!(!slot.take_interrupt());
    }
}
