//! Fiber-local storage
//!
//! Keys are process-global; values live in the fiber's entity and are
//! dropped when the fiber finishes. Outside fiber context every
//! accessor behaves as if the slot were empty.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fiber::FiberEntity;
use crate::tls;

/// Process-global storage key. Allocate once, use from any fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlsKey(usize);

static NEXT_KEY: AtomicUsize = AtomicUsize::new(0);

/// Allocate a fresh key. Keys are never recycled.
pub fn fls_alloc() -> FlsKey {
    FlsKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
}

/// Per-fiber value table, indexed by key. Sparse in practice; grown on
/// first write to a key.
pub(crate) type FlsTable = Vec<Option<Box<dyn Any + Send>>>;

fn with_current_entity<R>(f: impl FnOnce(&mut FiberEntity) -> R) -> Option<R> {
    if !tls::in_fiber() {
        return None;
    }
    // Safety: in_fiber() implies a live group on this worker thread
    let group = unsafe { &*tls::current_group_ptr() };
    let ctrl = group.control().ok()?;
    let slot = ctrl.table().slot(tls::current_fiber().slot());
    // Safety: we are the worker currently running this fiber
    Some(f(unsafe { slot.entity_mut() }))
}

/// Store a value for the current fiber. Returns false outside fiber
/// context.
pub fn fls_set<T: Send + 'static>(key: FlsKey, value: T) -> bool {
    with_current_entity(|entity| {
        let table = entity.fls.get_or_insert_with(Vec::new);
        if table.len() <= key.0 {
            table.resize_with(key.0 + 1, || None);
        }
        table[key.0] = Some(Box::new(value));
    })
    .is_some()
}

/// Borrow the current fiber's value for `key`, if any.
pub fn fls_with<T: 'static, R>(key: FlsKey, f: impl FnOnce(Option<&mut T>) -> R) -> R {
    let mut f = Some(f);
    with_current_entity(|entity| {
        let value = entity
            .fls
            .as_mut()
            .and_then(|t| t.get_mut(key.0))
            .and_then(|s| s.as_mut())
            .and_then(|b| b.downcast_mut::<T>());
        (f.take().unwrap())(value)
    })
    .unwrap_or_else(|| (f.take().unwrap())(None))
}

/// Remove and return the current fiber's value for `key`.
pub fn fls_take<T: Send + 'static>(key: FlsKey) -> Option<T> {
    with_current_entity(|entity| {
        let boxed = entity.fls.as_mut()?.get_mut(key.0)?.take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(_) => None,
        }
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_unique() {
        let a = fls_alloc();
        let b = fls_alloc();
        assert_ne!(a, b);
    }

    #[test]
    fn test_outside_fiber_is_empty() {
        let key = fls_alloc();
        assert!(!fls_set(key, 42u32));
        assert!(fls_with(key, |v: Option<&mut u32>| v.is_none()));
        assert_eq!(fls_take::<u32>(key), None);
    }
}
