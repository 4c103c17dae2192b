//! Mutex that suspends fibers instead of threads
//!
//! Classic three-state futex locking over a [`WaitableEvent`]: 0 free,
//! 1 locked, 2 locked with (possible) waiters. The uncontended paths
//! are a single CAS / swap; only contention touches the waiter list.
//! Works from plain threads too, where contention parks the thread.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use fiber_core::{FiberError, FiberResult};

use crate::event::WaitableEvent;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

pub struct FiberMutex<T: ?Sized> {
    event: WaitableEvent,
    data: UnsafeCell<T>,
}

// Safety: the lock word serializes access to data
unsafe impl<T: ?Sized + Send> Send for FiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        FiberMutex {
            event: WaitableEvent::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberMutex<T> {
    /// Acquire the lock, suspending the calling fiber while contended.
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        if self
            .event
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return FiberMutexGuard { lock: self };
        }
        loop {
            // Announce contention; if the lock was actually free the
            // swap acquires it (we hold it as CONTENDED, costing at
            // most one spurious wake at unlock)
            if self.event.value().swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return FiberMutexGuard { lock: self };
            }
            // Interrupt and spurious wakes just re-run the swap
            let _ = self.event.wait(CONTENDED, None);
        }
    }

    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        if self
            .event
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(FiberMutexGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire with a deadline. `TimedOut` if the lock stayed held.
    pub fn lock_timed(&self, timeout: Duration) -> FiberResult<FiberMutexGuard<'_, T>> {
        if self
            .event
            .value()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(FiberMutexGuard { lock: self });
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.event.value().swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return Ok(FiberMutexGuard { lock: self });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FiberError::TimedOut);
            }
            match self.event.wait(CONTENDED, Some(deadline - now)) {
                Err(FiberError::TimedOut) => return Err(FiberError::TimedOut),
                _ => continue,
            }
        }
    }

    fn unlock(&self) {
        if self.event.value().swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.event.wake_one();
        }
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        FiberMutex::new(T::default())
    }
}

pub struct FiberMutexGuard<'a, T: ?Sized> {
    lock: &'a FiberMutex<T>,
}

impl<'a, T: ?Sized> FiberMutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a FiberMutex<T> {
        self.lock
    }
}

impl<'a, T: ?Sized> Deref for FiberMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for FiberMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for FiberMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_uncontended() {
        let m = FiberMutex::new(5u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 6);
        assert_eq!(m.into_inner(), 6);
    }

    #[test]
    fn test_try_lock() {
        let m = FiberMutex::new(());
        let g = m.try_lock();
        assert!(g.is_some());
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_lock_timed_times_out() {
        let m = Arc::new(FiberMutex::new(()));
        let g = m.lock();
        let m2 = Arc::clone(&m);
        let h = thread::spawn(move || {
            let start = Instant::now();
            let r = m2.lock_timed(Duration::from_millis(50));
            (r.is_err(), start.elapsed())
        });
        let (timed_out, elapsed) = h.join().unwrap();
        assert!(timed_out);
        assert!(elapsed >= Duration::from_millis(40));
        drop(g);
        assert!(m.lock_timed(Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_contended_counter_threads() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 20_000;
        let m = Arc::new(FiberMutex::new(0usize));
        let mut handles = vec![];
        for _ in 0..THREADS {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), THREADS * PER_THREAD);
    }
}
