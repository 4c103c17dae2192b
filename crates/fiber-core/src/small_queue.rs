//! FIFO queue with inline capacity and heap overflow
//!
//! Used for token pending errors: the common case is zero or one queued
//! entry, which must not allocate. Entries beyond the inline capacity
//! spill into a `VecDeque`.

use std::collections::VecDeque;

/// Bounded-inline FIFO. Pops drain the inline buffer first, refilling it
/// from the overflow so ordering is preserved.
pub struct SmallQueue<T, const N: usize> {
    inline: [Option<T>; N],
    /// Index of the oldest inline entry
    head: usize,
    /// Number of live inline entries
    len: usize,
    overflow: Option<VecDeque<T>>,
}

impl<T, const N: usize> SmallQueue<T, N> {
    pub fn new() -> Self {
        Self {
            inline: [const { None }; N],
            head: 0,
            len: 0,
            overflow: None,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.len < N && self.overflow.as_ref().map_or(true, |o| o.is_empty()) {
            let tail = (self.head + self.len) % N;
            self.inline[tail] = Some(value);
            self.len += 1;
        } else {
            self.overflow.get_or_insert_with(VecDeque::new).push_back(value);
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.inline[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        // Keep the inline buffer full while the overflow drains
        if let Some(overflow) = self.overflow.as_mut() {
            if let Some(v) = overflow.pop_front() {
                let tail = (self.head + self.len) % N;
                self.inline[tail] = Some(v);
                self.len += 1;
            }
        }
        value
    }

    pub fn len(&self) -> usize {
        self.len + self.overflow.as_ref().map_or(0, |o| o.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.inline = [const { None }; N];
        self.head = 0;
        self.len = 0;
        self.overflow = None;
    }
}

impl<T, const N: usize> Default for SmallQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_only() {
        let mut q: SmallQueue<u32, 2> = SmallQueue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_overflow_preserves_order() {
        let mut q: SmallQueue<u32, 2> = SmallQueue::new();
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.len(), 10);
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_interleaved_push_pop() {
        let mut q: SmallQueue<u32, 2> = SmallQueue::new();
        let mut next_push = 0u32;
        let mut next_pop = 0u32;
        for round in 0..50 {
            for _ in 0..(round % 5) + 1 {
                q.push(next_push);
                next_push += 1;
            }
            for _ in 0..(round % 3) + 1 {
                if let Some(v) = q.pop() {
                    assert_eq!(v, next_pop);
                    next_pop += 1;
                }
            }
        }
        while let Some(v) = q.pop() {
            assert_eq!(v, next_pop);
            next_pop += 1;
        }
        assert_eq!(next_pop, next_push);
    }

    #[test]
    fn test_clear() {
        let mut q: SmallQueue<u32, 2> = SmallQueue::new();
        for i in 0..5 {
            q.push(i);
        }
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }
}
