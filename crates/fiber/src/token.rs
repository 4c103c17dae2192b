//! Token operations on the process-wide registry
//!
//! Thin wrappers over [`TokenRegistry`]; embedders running multiple
//! registries call the registry methods directly.

pub use fiber_core::Token;
pub use fiber_runtime::token::{
    global_registry, ErrorCallback, TokenRegistry, MAX_TOKEN_RANGE,
};

use fiber_core::FiberResult;

/// Create a token carrying `data`, delivered back on every error.
pub fn create(data: u64, on_error: Option<ErrorCallback>) -> Token {
    global_registry().create(data, on_error)
}

/// Create a token whose handle spans `range` versions.
pub fn create_ranged(data: u64, on_error: Option<ErrorCallback>, range: u32) -> FiberResult<Token> {
    global_registry().create_ranged(data, on_error, range)
}

/// Lock the token, suspending while contended. Returns the data word.
pub fn lock(token: Token) -> FiberResult<u64> {
    global_registry().lock(token)
}

/// Lock without waiting.
pub fn trylock(token: Token) -> FiberResult<u64> {
    global_registry().trylock(token)
}

/// Release the lock, or deliver the oldest queued error instead.
pub fn unlock(token: Token) -> FiberResult<()> {
    global_registry().unlock(token)
}

/// Raise an error against the token.
pub fn error(token: Token, code: i32, text: impl Into<String>) -> FiberResult<()> {
    global_registry().error(token, code, text)
}

/// Refuse new lockers; caller holds the lock and will destroy.
pub fn about_to_destroy(token: Token) -> FiberResult<()> {
    global_registry().about_to_destroy(token)
}

/// Release the lock and retire the token.
pub fn unlock_and_destroy(token: Token) -> FiberResult<()> {
    global_registry().unlock_and_destroy(token)
}

/// Retire an unlocked token.
pub fn cancel(token: Token) -> FiberResult<()> {
    global_registry().cancel(token)
}

/// Block until the token is destroyed.
pub fn join(token: Token) -> FiberResult<()> {
    global_registry().join(token)
}

/// True while the handle's version is live.
pub fn exists(token: Token) -> bool {
    global_registry().exists(token)
}

/// Lock and restart the version window at `range` versions.
pub fn lock_and_reset_range(token: Token, range: u32) -> FiberResult<u64> {
    global_registry().lock_and_reset_range(token, range)
}
