//! Fiber stack allocation and pooling
//!
//! Each stack is an anonymous mapping with a `PROT_NONE` guard page at
//! the low end, so overflow faults instead of corrupting a neighboring
//! allocation. Freed stacks go back to a lock-free per-class pool;
//! overflow past the pool capacity unmaps.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

use fiber_core::constants::GUARD_SIZE;
use fiber_core::{ferror, ftrace, FiberError, FiberResult, StackClass};

/// An owned, mapped fiber stack. Unmapped on drop.
pub struct Stack {
    base: NonNull<libc::c_void>,
    total: usize,
    class: StackClass,
}

// Safety: the mapping is exclusively owned; raw pointers are just its
// address.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a fresh stack for `class`, guard page included.
    pub fn allocate(class: StackClass) -> FiberResult<Stack> {
        let usable = class.stack_bytes();
        debug_assert!(usable > 0, "pthread class has no fiber stack");
        let total = usable + GUARD_SIZE;
        let len = NonZeroUsize::new(total).ok_or(FiberError::StackAllocation)?;

        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| {
            ferror!("stack mmap failed for {} class: {}", class, e);
            FiberError::StackAllocation
        })?;

        // Guard page at the low end (stacks grow down)
        if let Err(e) = unsafe { mprotect(base, GUARD_SIZE, ProtFlags::PROT_NONE) } {
            ferror!("stack guard mprotect failed: {}", e);
            let _ = unsafe { munmap(base, total) };
            return Err(FiberError::StackAllocation);
        }

        ftrace!("mapped {} stack: {} bytes at {:p}", class, total, base);
        Ok(Stack { base, total, class })
    }

    /// One past the highest usable byte; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { (self.base.as_ptr() as *mut u8).add(self.total) }
    }

    #[inline]
    pub fn usable_bytes(&self) -> usize {
        self.total - GUARD_SIZE
    }

    #[inline]
    pub fn class(&self) -> StackClass {
        self.class
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, self.total) } {
            ferror!("stack munmap failed: {}", e);
        }
    }
}

/// Lock-free stack caches, one per pooled size class.
pub struct StackPools {
    pools: [ArrayQueue<Stack>; StackClass::POOLED],
}

impl StackPools {
    pub fn new(capacity_per_class: usize) -> Self {
        let cap = capacity_per_class.max(1);
        StackPools {
            pools: [
                ArrayQueue::new(cap),
                ArrayQueue::new(cap),
                ArrayQueue::new(cap),
            ],
        }
    }

    /// Reuse a cached stack or map a fresh one.
    pub fn acquire(&self, class: StackClass) -> FiberResult<Stack> {
        if class == StackClass::Pthread {
            return Err(FiberError::StackAllocation);
        }
        if let Some(stack) = self.pools[class.as_index()].pop() {
            return Ok(stack);
        }
        Stack::allocate(class)
    }

    /// Return a stack to its pool; a full pool unmaps instead.
    pub fn release(&self, stack: Stack) {
        let idx = stack.class().as_index();
        // On push failure the rejected stack drops here, unmapping it
        let _ = self.pools[idx].push(stack);
    }

    /// Cached stack count across classes.
    pub fn cached(&self) -> usize {
        self.pools.iter().map(|p| p.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_write() {
        let stack = Stack::allocate(StackClass::Small).unwrap();
        assert_eq!(stack.usable_bytes(), StackClass::Small.stack_bytes());
        // Top of stack must be writable
        unsafe {
            let p = stack.top().sub(8);
            p.write_bytes(0xAB, 8);
            assert_eq!(*p, 0xAB);
        }
    }

    #[test]
    fn test_pool_reuse() {
        let pools = StackPools::new(4);
        let s = pools.acquire(StackClass::Small).unwrap();
        let addr = s.top() as usize;
        pools.release(s);
        assert_eq!(pools.cached(), 1);
        let s2 = pools.acquire(StackClass::Small).unwrap();
        assert_eq!(s2.top() as usize, addr);
        assert_eq!(pools.cached(), 0);
    }

    #[test]
    fn test_pool_overflow_unmaps() {
        let pools = StackPools::new(1);
        let a = pools.acquire(StackClass::Small).unwrap();
        let b = pools.acquire(StackClass::Small).unwrap();
        pools.release(a);
        pools.release(b); // pool full, must unmap without panicking
        assert_eq!(pools.cached(), 1);
    }

    #[test]
    fn test_pthread_class_has_no_stack() {
        let pools = StackPools::new(1);
        assert!(pools.acquire(StackClass::Pthread).is_err());
    }
}
