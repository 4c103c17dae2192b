//! # fiber-runtime
//!
//! M:N cooperative scheduling engine: worker threads multiplex many
//! stackful fibers over work-stealing run queues.
//!
//! ## Architecture
//!
//! - [`task_control`] - process-wide control: slot table, workers,
//!   parking, spawning, lifecycle ops
//! - [`task_group`] - per-worker group: run queues, the worker loop,
//!   context-switch dispatch
//! - [`event`] - futex-like waitable event every blocking primitive
//!   builds on
//! - [`timer`] - dedicated timer thread for deadlines and sleeps
//! - [`token`] - versioned cancellable handles for in-flight operations
//! - [`mutex`] / [`cond`] - fiber-suspending synchronization
//! - [`stack`] / [`arch`] - guard-paged stacks and the register-level
//!   context switch
//!
//! Blocking primitives are dual-mode: called from a fiber they suspend
//! the fiber, called from a plain thread they park the thread, so the
//! same synchronization code runs on both sides of the boundary.

#[cfg(not(unix))]
compile_error!("fiber-runtime requires a unix target (mmap stacks, futex parking)");

pub mod arch;
pub mod cond;
pub mod config;
pub mod event;
mod fiber;
pub mod fls;
pub mod mutex;
mod parking;
pub mod sleep;
pub mod stack;
pub mod task_control;
pub mod task_group;
pub mod timer;
mod tls;
pub mod token;
pub mod wsq;

pub use cond::FiberCond;
pub use config::SchedConfig;
pub use event::WaitableEvent;
pub use fls::{fls_alloc, fls_set, fls_take, fls_with, FlsKey};
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use sleep::{current_fiber_id, sleep, sleep_ms, sleep_us, yield_now};
pub use task_control::{global, global_init, SchedStats, TaskControl};
pub use timer::{TimerCallback, TimerThread, Unschedule};
pub use token::{global_registry, ErrorCallback, TokenRegistry, MAX_TOKEN_RANGE};

// Core types, re-exported so most users depend on one crate
pub use fiber_core::{FiberAttr, FiberError, FiberId, FiberResult, StackClass, TimerId, Token};
