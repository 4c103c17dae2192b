//! Versioned cancellable tokens
//!
//! A token names an in-flight operation (an RPC call, typically) in a
//! way that is safe against ABA reuse: the handle carries a version,
//! and every slot operation first checks the version against the
//! slot's live window. After `unlock_and_destroy` the window advances
//! past every issued version, so stale handles fail with `StaleHandle`
//! instead of touching a recycled slot.
//!
//! The slot's `state` event holds a version-derived word:
//!
//! - `first_ver`        unlocked
//! - `locked_ver`       locked (`first_ver + range`)
//! - `locked_ver + 1`   locked with waiters
//! - `locked_ver + 2`   about to be destroyed; new lockers are refused
//!
//! Destroy advances `first_ver` to `locked_ver + 3`, which both stales
//! old handles and becomes the unlocked word of the next occupant.
//!
//! Errors raised against a locked token queue up and are delivered one
//! per unlock, in order, through the token's error callback; the
//! callback owns the lock and must unlock or destroy.

use std::sync::{Arc, OnceLock};

use fiber_core::{ferror, FiberError, FiberResult, SmallQueue, SpinLock, Token};

use crate::event::WaitableEvent;

/// Most versions a single token may span.
pub const MAX_TOKEN_RANGE: u32 = 1024;

/// Invoked with `(token, data, error_code, error_text)` while the token
/// is locked by the runtime. The callback must release the lock, via
/// `unlock` or `unlock_and_destroy`.
pub type ErrorCallback = Arc<dyn Fn(Token, u64, i32, &str) + Send + Sync>;

struct PendingError {
    code: i32,
    text: String,
}

struct TokenMeta {
    first_ver: u32,
    locked_ver: u32,
    data: u64,
    on_error: Option<ErrorCallback>,
    pending: SmallQueue<PendingError, 2>,
}

impl TokenMeta {
    #[inline]
    fn holds(&self, version: u32) -> bool {
        self.first_ver <= version && version < self.locked_ver
    }
}

struct TokenSlot {
    meta: SpinLock<TokenMeta>,
    /// Lock word, see module docs
    state: WaitableEvent,
    /// Joiners wait for the value to advance past their version
    join: WaitableEvent,
}

impl TokenSlot {
    fn fresh() -> Arc<TokenSlot> {
        Arc::new(TokenSlot {
            meta: SpinLock::new(TokenMeta {
                first_ver: 1,
                locked_ver: 1,
                data: 0,
                on_error: None,
                pending: SmallQueue::new(),
            }),
            state: WaitableEvent::new(1),
            join: WaitableEvent::new(1),
        })
    }
}

pub struct TokenRegistry {
    slots: SpinLock<Vec<Arc<TokenSlot>>>,
    free: SpinLock<Vec<u32>>,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRegistry {
    pub fn new() -> Self {
        TokenRegistry {
            slots: SpinLock::new(Vec::new()),
            free: SpinLock::new(Vec::new()),
        }
    }

    /// Create a token with a single valid version.
    pub fn create(&self, data: u64, on_error: Option<ErrorCallback>) -> Token {
        // range 1 can't fail
        self.create_ranged(data, on_error, 1).unwrap()
    }

    /// Create a token whose handle spans `range` versions, for callers
    /// that re-issue the handle with bumped versions between uses.
    pub fn create_ranged(
        &self,
        data: u64,
        on_error: Option<ErrorCallback>,
        range: u32,
    ) -> FiberResult<Token> {
        if range == 0 || range > MAX_TOKEN_RANGE {
            return Err(FiberError::InvalidArgument);
        }
        let (idx, slot) = match self.free.lock().pop() {
            Some(i) => (i, Arc::clone(&self.slots.lock()[i as usize])),
            None => {
                let mut slots = self.slots.lock();
                let i = slots.len() as u32;
                let s = TokenSlot::fresh();
                slots.push(Arc::clone(&s));
                (i, s)
            }
        };
        let mut meta = slot.meta.lock();
        let first = meta.first_ver;
        meta.locked_ver = first + range;
        meta.data = data;
        meta.on_error = on_error;
        meta.pending.clear();
        slot.state.value().store(first, std::sync::atomic::Ordering::SeqCst);
        slot.join.value().store(first, std::sync::atomic::Ordering::SeqCst);
        Ok(Token::new(idx, first))
    }

    fn get(&self, token: Token) -> FiberResult<Arc<TokenSlot>> {
        let idx = token.slot().ok_or(FiberError::StaleHandle)?;
        self.slots
            .lock()
            .get(idx as usize)
            .cloned()
            .ok_or(FiberError::StaleHandle)
    }

    /// True while the handle's version is in the live window.
    pub fn exists(&self, token: Token) -> bool {
        match self.get(token) {
            Ok(slot) => slot.meta.lock().holds(token.version()),
            Err(_) => false,
        }
    }

    /// Lock the token, waiting if someone else holds it. Returns the
    /// token's data word.
    pub fn lock(&self, token: Token) -> FiberResult<u64> {
        self.lock_impl(token, None)
    }

    /// Lock the token and, on acquisition, restart the version window
    /// at `first_ver..first_ver + range`.
    pub fn lock_and_reset_range(&self, token: Token, range: u32) -> FiberResult<u64> {
        if range == 0 || range > MAX_TOKEN_RANGE {
            return Err(FiberError::InvalidArgument);
        }
        self.lock_impl(token, Some(range))
    }

    fn lock_impl(&self, token: Token, reset_range: Option<u32>) -> FiberResult<u64> {
        use std::sync::atomic::Ordering::SeqCst;
        let slot = self.get(token)?;
        loop {
            let contended;
            {
                let mut meta = slot.meta.lock();
                if !meta.holds(token.version()) {
                    return Err(FiberError::StaleHandle);
                }
                let first = meta.first_ver;
                let locked = meta.locked_ver;
                let v = slot.state.value().load(SeqCst);
                if v == locked + 2 {
                    return Err(FiberError::Permission);
                }
                if v == first {
                    if let Some(range) = reset_range {
                        meta.locked_ver = first + range;
                    }
                    slot.state.value().store(meta.locked_ver, SeqCst);
                    return Ok(meta.data);
                }
                if v == locked {
                    slot.state.value().store(locked + 1, SeqCst);
                }
                contended = locked + 1;
            }
            match slot.state.wait(contended, None) {
                Ok(()) | Err(FiberError::WouldBlock) | Err(FiberError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Lock without waiting. `Busy` if held.
    pub fn trylock(&self, token: Token) -> FiberResult<u64> {
        use std::sync::atomic::Ordering::SeqCst;
        let slot = self.get(token)?;
        let mut meta = slot.meta.lock();
        if !meta.holds(token.version()) {
            return Err(FiberError::StaleHandle);
        }
        let v = slot.state.value().load(SeqCst);
        if v == meta.locked_ver + 2 {
            return Err(FiberError::Permission);
        }
        if v != meta.first_ver {
            return Err(FiberError::Busy);
        }
        slot.state.value().store(meta.locked_ver, SeqCst);
        Ok(meta.data)
    }

    /// Release the lock. If errors queued up while it was held, the
    /// oldest is delivered instead: the token stays locked and the
    /// error callback runs, which must itself unlock or destroy.
    pub fn unlock(&self, token: Token) -> FiberResult<()> {
        use std::sync::atomic::Ordering::SeqCst;
        let slot = self.get(token)?;
        let delivery;
        {
            let mut meta = slot.meta.lock();
            if !meta.holds(token.version()) {
                return Err(FiberError::StaleHandle);
            }
            let first = meta.first_ver;
            let locked = meta.locked_ver;
            let v = slot.state.value().load(SeqCst);
            if v == locked + 2 {
                // about_to_destroy holders must finish with
                // unlock_and_destroy
                return Err(FiberError::Permission);
            }
            if v == first {
                return Err(FiberError::Permission);
            }
            match meta.pending.pop() {
                Some(pe) => {
                    delivery = (pe, meta.on_error.clone(), meta.data);
                }
                None => {
                    let was_contended = v == locked + 1;
                    slot.state.value().store(first, SeqCst);
                    drop(meta);
                    if was_contended {
                        slot.state.wake_one();
                    }
                    return Ok(());
                }
            }
        }
        let (pe, cb, data) = delivery;
        self.deliver_error(token, cb, data, pe.code, &pe.text);
        Ok(())
    }

    /// Raise an error against the token. If unlocked, the runtime
    /// locks it and runs the error callback now; if locked, the error
    /// queues for delivery at the next unlock.
    pub fn error(&self, token: Token, code: i32, text: impl Into<String>) -> FiberResult<()> {
        use std::sync::atomic::Ordering::SeqCst;
        let text = text.into();
        let slot = self.get(token)?;
        let delivery;
        {
            let mut meta = slot.meta.lock();
            if !meta.holds(token.version()) {
                return Err(FiberError::StaleHandle);
            }
            let first = meta.first_ver;
            let locked = meta.locked_ver;
            let v = slot.state.value().load(SeqCst);
            if v == locked + 2 {
                return Err(FiberError::Permission);
            }
            if v == first {
                slot.state.value().store(locked, SeqCst);
                delivery = Some((meta.on_error.clone(), meta.data));
            } else {
                meta.pending.push(PendingError { code, text });
                return Ok(());
            }
        }
        if let Some((cb, data)) = delivery {
            self.deliver_error(token, cb, data, code, &text);
        }
        Ok(())
    }

    fn deliver_error(&self, token: Token, cb: Option<ErrorCallback>, data: u64, code: i32, text: &str) {
        match cb {
            Some(cb) => cb(token, data, code, text),
            None => {
                ferror!("token {:?} error {}: {}", token, code, text);
                let _ = self.unlock_and_destroy(token);
            }
        }
    }

    /// Refuse new lockers from now on: pending and future `lock` calls
    /// fail with `Permission`. Caller must hold the lock and finish
    /// with [`unlock_and_destroy`](Self::unlock_and_destroy).
    pub fn about_to_destroy(&self, token: Token) -> FiberResult<()> {
        use std::sync::atomic::Ordering::SeqCst;
        let slot = self.get(token)?;
        let was_contended;
        {
            let meta = slot.meta.lock();
            if !meta.holds(token.version()) {
                return Err(FiberError::StaleHandle);
            }
            let v = slot.state.value().load(SeqCst);
            if v == meta.locked_ver + 2 {
                return Ok(());
            }
            if v == meta.first_ver {
                return Err(FiberError::Permission);
            }
            was_contended = v == meta.locked_ver + 1;
            slot.state.value().store(meta.locked_ver + 2, SeqCst);
        }
        if was_contended {
            // Waiters re-scan, observe the destroying word and bail
            slot.state.wake_all();
        }
        Ok(())
    }

    /// Release the lock and retire the token: every issued version goes
    /// stale, joiners wake, the slot is recycled.
    pub fn unlock_and_destroy(&self, token: Token) -> FiberResult<()> {
        self.destroy_impl(token, true)
    }

    /// Retire an unlocked token. `Permission` if currently locked.
    pub fn cancel(&self, token: Token) -> FiberResult<()> {
        self.destroy_impl(token, false)
    }

    fn destroy_impl(&self, token: Token, expect_locked: bool) -> FiberResult<()> {
        use std::sync::atomic::Ordering::SeqCst;
        let slot = self.get(token)?;
        {
            let mut meta = slot.meta.lock();
            if !meta.holds(token.version()) {
                return Err(FiberError::StaleHandle);
            }
            let v = slot.state.value().load(SeqCst);
            let locked_now = v != meta.first_ver;
            if locked_now != expect_locked {
                return Err(FiberError::Permission);
            }
            let next = meta.locked_ver + 3;
            meta.first_ver = next;
            meta.locked_ver = next;
            meta.data = 0;
            meta.on_error = None;
            meta.pending.clear();
            slot.state.value().store(next, SeqCst);
            slot.join.value().store(next, SeqCst);
        }
        slot.state.wake_all();
        slot.join.wake_all();
        // Index of a valid token is always Some
        if let Some(idx) = token.slot() {
            self.free.lock().push(idx);
        }
        Ok(())
    }

    /// Block until the token is destroyed. Returns immediately for a
    /// handle whose version is already out of window.
    pub fn join(&self, token: Token) -> FiberResult<()> {
        use std::sync::atomic::Ordering::SeqCst;
        let slot = self.get(token)?;
        {
            let meta = slot.meta.lock();
            if !meta.holds(token.version()) {
                return Ok(());
            }
        }
        loop {
            let current = slot.join.value().load(SeqCst);
            if current > token.version() {
                return Ok(());
            }
            match slot.join.wait(current, None) {
                Ok(()) | Err(FiberError::WouldBlock) | Err(FiberError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<TokenRegistry> = OnceLock::new();

/// The process-wide token registry.
pub fn global_registry() -> &'static TokenRegistry {
    GLOBAL_REGISTRY.get_or_init(TokenRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_unlock_destroy_lifecycle() {
        let reg = TokenRegistry::new();
        let t = reg.create(42, None);
        assert!(reg.exists(t));
        assert_eq!(reg.lock(t), Ok(42));
        reg.unlock(t).unwrap();
        assert_eq!(reg.lock(t), Ok(42));
        reg.unlock_and_destroy(t).unwrap();
        assert!(!reg.exists(t));
        assert_eq!(reg.lock(t), Err(FiberError::StaleHandle));
    }

    #[test]
    fn test_slot_reuse_stales_old_handle() {
        let reg = TokenRegistry::new();
        let a = reg.create(1, None);
        reg.cancel(a).unwrap();
        let b = reg.create(2, None);
        // Same slot, advanced version
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.version(), b.version());
        assert_eq!(reg.lock(a), Err(FiberError::StaleHandle));
        assert_eq!(reg.lock(b), Ok(2));
        reg.unlock(b).unwrap();
    }

    #[test]
    fn test_trylock_busy() {
        let reg = TokenRegistry::new();
        let t = reg.create(0, None);
        assert!(reg.trylock(t).is_ok());
        assert_eq!(reg.trylock(t), Err(FiberError::Busy));
        reg.unlock(t).unwrap();
        assert!(reg.trylock(t).is_ok());
        reg.unlock(t).unwrap();
    }

    #[test]
    fn test_unlock_unlocked_is_permission() {
        let reg = TokenRegistry::new();
        let t = reg.create(0, None);
        assert_eq!(reg.unlock(t), Err(FiberError::Permission));
    }

    #[test]
    fn test_contended_lock() {
        let reg = Arc::new(TokenRegistry::new());
        let t = reg.create(7, None);
        reg.lock(t).unwrap();

        let reg2 = Arc::clone(&reg);
        let h = thread::spawn(move || reg2.lock(t));
        thread::sleep(Duration::from_millis(30));
        reg.unlock(t).unwrap();
        assert_eq!(h.join().unwrap(), Ok(7));
        reg.unlock(t).unwrap();
    }

    #[test]
    fn test_error_on_unlocked_runs_callback() {
        let reg = Arc::new(TokenRegistry::new());
        let seen = Arc::new(AtomicI32::new(0));
        let s = Arc::clone(&seen);
        let reg_cb = Arc::clone(&reg);
        let cb: ErrorCallback = Arc::new(move |tok, data, code, _text| {
            assert_eq!(data, 9);
            s.store(code, Ordering::SeqCst);
            reg_cb.unlock_and_destroy(tok).unwrap();
        });
        let t = reg.create(9, Some(cb));
        reg.error(t, 108, "remote reset").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 108);
        assert!(!reg.exists(t));
    }

    #[test]
    fn test_errors_queue_while_locked_and_deliver_in_order() {
        let reg = Arc::new(TokenRegistry::new());
        let order = Arc::new(SpinLock::new(Vec::new()));
        let o = Arc::clone(&order);
        let reg_cb = Arc::clone(&reg);
        let cb: ErrorCallback = Arc::new(move |tok, _data, code, _text| {
            o.lock().push(code);
            reg_cb.unlock(tok).unwrap();
        });
        let t = reg.create(0, Some(cb));

        reg.lock(t).unwrap();
        reg.error(t, 1, "first").unwrap();
        reg.error(t, 2, "second").unwrap();
        assert!(order.lock().is_empty(), "delivery waits for unlock");

        // Each unlock delivers one queued error; the callback's own
        // unlock delivers the next
        reg.unlock(t).unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
        // Queue drained; the callback's final unlock released the token
        assert_eq!(reg.lock(t), Ok(0));
        reg.unlock(t).unwrap();
    }

    #[test]
    fn test_about_to_destroy_refuses_new_lockers() {
        let reg = Arc::new(TokenRegistry::new());
        let t = reg.create(0, None);
        reg.lock(t).unwrap();
        reg.about_to_destroy(t).unwrap();
        assert_eq!(reg.lock(t), Err(FiberError::Permission));
        assert_eq!(reg.trylock(t), Err(FiberError::Permission));
        // Plain unlock is refused; destruction is the only way out
        assert_eq!(reg.unlock(t), Err(FiberError::Permission));
        reg.unlock_and_destroy(t).unwrap();
        assert!(!reg.exists(t));
    }

    #[test]
    fn test_about_to_destroy_releases_waiters() {
        let reg = Arc::new(TokenRegistry::new());
        let t = reg.create(0, None);
        reg.lock(t).unwrap();
        let reg2 = Arc::clone(&reg);
        let h = thread::spawn(move || reg2.lock(t));
        thread::sleep(Duration::from_millis(30));
        reg.about_to_destroy(t).unwrap();
        assert_eq!(h.join().unwrap(), Err(FiberError::Permission));
        reg.unlock_and_destroy(t).unwrap();
    }

    #[test]
    fn test_cancel_requires_unlocked() {
        let reg = TokenRegistry::new();
        let t = reg.create(0, None);
        reg.lock(t).unwrap();
        assert_eq!(reg.cancel(t), Err(FiberError::Permission));
        reg.unlock(t).unwrap();
        reg.cancel(t).unwrap();
        assert!(!reg.exists(t));
    }

    #[test]
    fn test_join_blocks_until_destroy() {
        let reg = Arc::new(TokenRegistry::new());
        let t = reg.create(0, None);
        let joined = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..2 {
            let reg = Arc::clone(&reg);
            let joined = Arc::clone(&joined);
            handles.push(thread::spawn(move || {
                reg.join(t).unwrap();
                joined.fetch_add(1, Ordering::SeqCst);
            }));
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(joined.load(Ordering::SeqCst), 0);

        reg.lock(t).unwrap();
        reg.unlock_and_destroy(t).unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(joined.load(Ordering::SeqCst), 2);
        // Joining a destroyed token returns immediately
        reg.join(t).unwrap();
    }

    #[test]
    fn test_ranged_versions_share_the_token() {
        let reg = TokenRegistry::new();
        let t = reg.create_ranged(5, None, 3).unwrap();
        let v1 = Token::new(t.slot().unwrap(), t.version() + 1);
        let v2 = Token::new(t.slot().unwrap(), t.version() + 2);
        let out = Token::new(t.slot().unwrap(), t.version() + 3);

        assert_eq!(reg.lock(v1), Ok(5));
        reg.unlock(v2).unwrap();
        assert_eq!(reg.lock(out), Err(FiberError::StaleHandle));
        assert_eq!(reg.lock(t), Ok(5));
        reg.unlock_and_destroy(v1).unwrap();
        assert!(!reg.exists(v2));
    }

    #[test]
    fn test_lock_and_reset_range() {
        let reg = TokenRegistry::new();
        let t = reg.create(0, None);
        assert_eq!(reg.lock_and_reset_range(t, 4), Ok(0));
        // The window now spans four versions
        let v3 = Token::new(t.slot().unwrap(), t.version() + 3);
        reg.unlock(v3).unwrap();
        assert_eq!(reg.lock(v3), Ok(0));
        reg.unlock_and_destroy(t).unwrap();
    }

    #[test]
    fn test_bad_range_rejected() {
        let reg = TokenRegistry::new();
        assert_eq!(
            reg.create_ranged(0, None, 0).unwrap_err(),
            FiberError::InvalidArgument
        );
        assert_eq!(
            reg.create_ranged(0, None, MAX_TOKEN_RANGE + 1).unwrap_err(),
            FiberError::InvalidArgument
        );
    }
}
