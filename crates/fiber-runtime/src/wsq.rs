//! Bounded work-stealing run queue
//!
//! Single-owner deque over raw fiber ids: the owning worker pushes and
//! pops at the bottom without contention, other workers steal from the
//! top with a CAS. The buffer is a fixed power-of-two ring; a full
//! queue rejects the push and the caller falls back to the shared
//! remote queue.

use std::sync::atomic::{fence, AtomicU64, Ordering};

pub struct WorkStealingQueue {
    bottom: AtomicU64,
    top: AtomicU64,
    mask: u64,
    buffer: Box<[AtomicU64]>,
}

impl WorkStealingQueue {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let buffer = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        WorkStealingQueue {
            bottom: AtomicU64::new(1),
            top: AtomicU64::new(1),
            mask: capacity as u64 - 1,
            buffer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Approximate occupancy, for stats only.
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b.saturating_sub(t) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner only. Returns false when full.
    pub fn push(&self, value: u64) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.buffer.len() as u64 {
            return false;
        }
        self.buffer[(b & self.mask) as usize].store(value, Ordering::Relaxed);
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Owner only. Takes the most recently pushed value.
    pub fn pop(&self) -> Option<u64> {
        let b = self.bottom.load(Ordering::Relaxed);
        let mut t = self.top.load(Ordering::Relaxed);
        if t >= b {
            return None;
        }
        let newb = b - 1;
        self.bottom.store(newb, Ordering::Relaxed);
        // Order the bottom move before re-reading top, against a
        // concurrent steal's CAS
        fence(Ordering::SeqCst);
        t = self.top.load(Ordering::Relaxed);
        if t > newb {
            // A thief took the last element while we were moving bottom
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }
        let value = self.buffer[(newb & self.mask) as usize].load(Ordering::Relaxed);
        if t != newb {
            return Some(value);
        }
        // Single element left: settle the race with any thief on top
        let popped = self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b, Ordering::Relaxed);
        if popped {
            Some(value)
        } else {
            None
        }
    }

    /// Any thread. Takes the oldest value.
    pub fn steal(&self) -> Option<u64> {
        let mut t = self.top.load(Ordering::Acquire);
        let mut b = self.bottom.load(Ordering::Acquire);
        loop {
            if t >= b {
                return None;
            }
            let value = self.buffer[(t & self.mask) as usize].load(Ordering::Relaxed);
            // A successful CAS proves the slot was not yet recycled by
            // the owner, so the read value is the live element
            match self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Some(value),
                Err(cur) => {
                    t = cur;
                    b = self.bottom.load(Ordering::Acquire);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_lifo() {
        let q = WorkStealingQueue::new(8);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_steal_fifo() {
        let q = WorkStealingQueue::new(8);
        for v in 1..=3 {
            assert!(q.push(v));
        }
        assert_eq!(q.steal(), Some(1));
        assert_eq!(q.steal(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.steal(), None);
    }

    #[test]
    fn test_full_rejects() {
        let q = WorkStealingQueue::new(4);
        for v in 1..=4 {
            assert!(q.push(v));
        }
        assert!(!q.push(5));
        assert_eq!(q.steal(), Some(1));
        assert!(q.push(5));
    }

    #[test]
    fn test_concurrent_exactly_once() {
        // One owner pushing and popping, several thieves stealing; every
        // pushed value must surface exactly once.
        const TOTAL: u64 = 100_000;
        const THIEVES: usize = 3;

        let q = Arc::new(WorkStealingQueue::new(1024));
        let done = Arc::new(AtomicBool::new(false));

        let mut thieves = vec![];
        for _ in 0..THIEVES {
            let q = Arc::clone(&q);
            let done = Arc::clone(&done);
            thieves.push(thread::spawn(move || {
                let mut got = vec![];
                while !done.load(Ordering::Acquire) || !q.is_empty() {
                    match q.steal() {
                        Some(v) => got.push(v),
                        None => thread::yield_now(),
                    }
                }
                got
            }));
        }

        let mut owner_got = vec![];
        let mut next = 1u64;
        while next <= TOTAL {
            if q.push(next) {
                next += 1;
            } else if let Some(v) = q.pop() {
                owner_got.push(v);
            }
            if next % 64 == 0 {
                if let Some(v) = q.pop() {
                    owner_got.push(v);
                }
            }
        }
        done.store(true, Ordering::Release);

        let mut seen: HashSet<u64> = HashSet::new();
        for v in owner_got {
            assert!(seen.insert(v), "value {} surfaced twice", v);
        }
        for h in thieves {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "value {} surfaced twice", v);
            }
        }
        while let Some(v) = q.pop() {
            assert!(seen.insert(v), "value {} surfaced twice", v);
        }
        assert_eq!(seen.len(), TOTAL as usize);
    }
}
