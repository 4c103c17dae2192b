//! Per-thread parking primitive
//!
//! Used by non-fiber threads that block on a [`WaitableEvent`]: each
//! waiting thread gets its own parker, and the waker unparks exactly
//! that thread. On Linux this is a raw futex on a private word; other
//! unix targets fall back to a mutex/condvar pair.
//!
//! [`WaitableEvent`]: crate::event::WaitableEvent

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub use futex::ThreadParker;
    } else {
        pub use condvar::ThreadParker;
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const EMPTY: u32 = 0;
    const NOTIFIED: u32 = 1;

    /// Futex-backed parker. A permit (NOTIFIED) is sticky: an unpark
    /// before the park makes the park return immediately.
    pub struct ThreadParker {
        word: AtomicU32,
    }

    impl ThreadParker {
        pub const fn new() -> Self {
            ThreadParker {
                word: AtomicU32::new(EMPTY),
            }
        }

        /// Block until unparked or the timeout elapses. Returns true if a
        /// permit was consumed. Spurious returns are allowed.
        pub fn park(&self, timeout: Option<Duration>) -> bool {
            if self.word.swap(EMPTY, Ordering::Acquire) == NOTIFIED {
                return true;
            }
            futex_wait(&self.word, EMPTY, timeout);
            self.word.swap(EMPTY, Ordering::Acquire) == NOTIFIED
        }

        /// Deposit a permit and wake the parked thread if any.
        pub fn unpark(&self) {
            if self.word.swap(NOTIFIED, Ordering::Release) == EMPTY {
                futex_wake(&self.word);
            }
        }
    }

    fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ts_ptr,
            );
        }
    }

    fn futex_wake(word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod condvar {
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    /// Portable parker for non-Linux targets.
    pub struct ThreadParker {
        notified: Mutex<bool>,
        cond: Condvar,
    }

    impl ThreadParker {
        pub fn new() -> Self {
            ThreadParker {
                notified: Mutex::new(false),
                cond: Condvar::new(),
            }
        }

        pub fn park(&self, timeout: Option<Duration>) -> bool {
            let mut notified = self.notified.lock().unwrap();
            if !*notified {
                match timeout {
                    Some(d) => {
                        let (guard, _) = self.cond.wait_timeout(notified, d).unwrap();
                        notified = guard;
                    }
                    None => {
                        notified = self.cond.wait(notified).unwrap();
                    }
                }
            }
            std::mem::replace(&mut *notified, false)
        }

        pub fn unpark(&self) {
            let mut notified = self.notified.lock().unwrap();
            *notified = true;
            self.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_unpark_before_park() {
        let p = ThreadParker::new();
        p.unpark();
        assert!(p.park(None));
    }

    #[test]
    fn test_park_timeout() {
        let p = ThreadParker::new();
        let start = Instant::now();
        let woken = p.park(Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_cross_thread_unpark() {
        let p = Arc::new(ThreadParker::new());
        let p2 = Arc::clone(&p);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            p2.unpark();
        });
        // Loop: park may return spuriously before the permit arrives
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut woken = false;
        while Instant::now() < deadline {
            if p.park(Some(Duration::from_millis(100))) {
                woken = true;
                break;
            }
        }
        assert!(woken);
        h.join().unwrap();
    }
}
