//! Identifier types for fibers, tokens and timers
//!
//! All handles are generation-tagged: the low half indexes a slot table,
//! the high half carries the slot's version at creation time. A version
//! mismatch means the slot was reused and the handle is stale.

use core::fmt;

/// Unique identifier for a fiber.
///
/// Packs `(slot index, version)` into a `u64`. Version 0 is never
/// assigned, so the all-zero value doubles as the "no fiber" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber.
    pub const NONE: FiberId = FiberId(0);

    /// Build an id from slot index and version.
    #[inline]
    pub const fn new(slot: u32, version: u32) -> Self {
        FiberId(((slot as u64) << 32) | version as u64)
    }

    /// Reconstruct from the raw packed value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        FiberId(raw)
    }

    /// Raw packed value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Slot table index.
    #[inline]
    pub const fn slot(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Version the slot had when this id was issued.
    #[inline]
    pub const fn version(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({}v{})", self.slot(), self.version())
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}v{}", self.slot(), self.version())
        }
    }
}

/// Versioned cancellable handle used to track in-flight operations.
///
/// Layout: `(slot index + 1) << 32 | version`. The `+ 1` keeps the
/// all-zero value free as an "invalid token" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(u64);

impl Token {
    /// Sentinel value indicating an invalid token.
    pub const INVALID: Token = Token(0);

    #[inline]
    pub const fn new(slot: u32, version: u32) -> Self {
        Token((((slot as u64) + 1) << 32) | version as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Slot table index, or `None` for the invalid sentinel.
    #[inline]
    pub const fn slot(self) -> Option<u32> {
        let hi = (self.0 >> 32) as u32;
        if hi == 0 {
            None
        } else {
            Some(hi - 1)
        }
    }

    #[inline]
    pub const fn version(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 >> 32) != 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot() {
            Some(s) => write!(f, "Token({}v{})", s, self.version()),
            None => write!(f, "Token(INVALID)"),
        }
    }
}

/// Handle to a scheduled timer task.
///
/// Ids are assigned from a monotonic counter and never reused, so a
/// stale id can always be detected by lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct TimerId(pub u64);

impl TimerId {
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}
