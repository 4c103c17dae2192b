//! Condition variable over a sequence event
//!
//! The event value is a wakeup sequence number. `wait` snapshots it
//! before releasing the mutex; a signal that lands in the gap bumps
//! the value, so the subsequent event wait returns `WouldBlock`
//! instead of sleeping through the wakeup. Spurious wakeups are
//! possible by design; callers loop on their predicate.

use std::sync::atomic::Ordering;
use std::time::Duration;

use fiber_core::{FiberError, FiberResult};

use crate::event::WaitableEvent;
use crate::mutex::FiberMutexGuard;

pub struct FiberCond {
    seq: WaitableEvent,
}

impl Default for FiberCond {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberCond {
    pub fn new() -> Self {
        FiberCond {
            seq: WaitableEvent::new(0),
        }
    }

    /// Release the mutex, wait for a signal, reacquire. The guard is
    /// handed back locked either way.
    pub fn wait<'a, T: ?Sized>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let expected = self.seq.value().load(Ordering::SeqCst);
        let mutex = guard.mutex();
        drop(guard);
        let _ = self.seq.wait(expected, None);
        mutex.lock()
    }

    /// Like [`wait`](Self::wait) with a timeout. The result reports
    /// `TimedOut`; the guard is reacquired regardless.
    pub fn wait_timed<'a, T: ?Sized>(
        &self,
        guard: FiberMutexGuard<'a, T>,
        timeout: Duration,
    ) -> (FiberMutexGuard<'a, T>, FiberResult<()>) {
        let expected = self.seq.value().load(Ordering::SeqCst);
        let mutex = guard.mutex();
        drop(guard);
        let result = match self.seq.wait(expected, Some(timeout)) {
            Err(FiberError::TimedOut) => Err(FiberError::TimedOut),
            _ => Ok(()),
        };
        (mutex.lock(), result)
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        self.seq.value().fetch_add(1, Ordering::SeqCst);
        self.seq.wake_one();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.seq.value().fetch_add(1, Ordering::SeqCst);
        self.seq.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::FiberMutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_signal_wakes_waiter() {
        let pair = Arc::new((FiberMutex::new(false), FiberCond::new()));
        let pair2 = Arc::clone(&pair);
        let h = thread::spawn(move || {
            let (m, c) = &*pair2;
            let mut g = m.lock();
            while !*g {
                g = c.wait(g);
            }
        });
        thread::sleep(Duration::from_millis(20));
        {
            let (m, c) = &*pair;
            *m.lock() = true;
            c.signal();
        }
        h.join().unwrap();
    }

    #[test]
    fn test_no_lost_wakeup() {
        // Signal racing the gap between unlock and wait: the sequence
        // snapshot must prevent sleeping through it.
        let pair = Arc::new((FiberMutex::new(0u32), FiberCond::new()));
        for _ in 0..100 {
            let pair2 = Arc::clone(&pair);
            let h = thread::spawn(move || {
                let (m, c) = &*pair2;
                let mut g = m.lock();
                *g += 1;
                while *g != 0 {
                    g = c.wait(g);
                }
            });
            let (m, c) = &*pair;
            loop {
                let mut g = m.lock();
                if *g == 1 {
                    *g = 0;
                    drop(g);
                    c.signal();
                    break;
                }
                drop(g);
                thread::yield_now();
            }
            h.join().unwrap();
        }
    }

    #[test]
    fn test_wait_timed_timeout() {
        let pair = (FiberMutex::new(()), FiberCond::new());
        let g = pair.0.lock();
        let start = Instant::now();
        let (g, r) = pair.1.wait_timed(g, Duration::from_millis(50));
        assert_eq!(r, Err(FiberError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(40));
        drop(g);
    }

    #[test]
    fn test_broadcast_wakes_all() {
        const N: usize = 4;
        let pair = Arc::new((FiberMutex::new(false), FiberCond::new()));
        let mut handles = vec![];
        for _ in 0..N {
            let pair = Arc::clone(&pair);
            handles.push(thread::spawn(move || {
                let (m, c) = &*pair;
                let mut g = m.lock();
                while !*g {
                    g = c.wait(g);
                }
            }));
        }
        thread::sleep(Duration::from_millis(30));
        {
            let (m, c) = &*pair;
            *m.lock() = true;
            c.broadcast();
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
