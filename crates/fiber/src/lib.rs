//! # fiber - M:N cooperative fiber scheduler
//!
//! Many lightweight stackful fibers multiplexed over a small pool of
//! worker threads with work-stealing run queues.
//!
//! ## Features
//!
//! - **Cheap fibers**: pooled mmap stacks with guard pages, slot-table
//!   ids that stale safely on reuse
//! - **Fast switches**: callee-saved-only context switch in assembly,
//!   no signal frames
//! - **Dual-mode blocking**: mutexes, condvars, sleeps and joins
//!   suspend a fiber or park a plain thread, whichever is calling
//! - **Cancellation**: versioned tokens with queued error delivery,
//!   plus interrupt/stop on fiber ids
//! - **Timers**: one timer thread drives every deadline in the process
//!
//! ## Quick Start
//!
//! ```no_run
//! use fiber::{Runtime, SchedConfig};
//!
//! let rt = Runtime::new(SchedConfig::default()).unwrap();
//! let id = rt.spawn(|| {
//!     println!("hello from a fiber");
//!     fiber::yield_now();
//!     fiber::sleep_ms(10).unwrap();
//! }).unwrap();
//! rt.join(id).unwrap();
//! ```
//!
//! Or use the process-wide scheduler, started lazily from environment
//! configuration:
//!
//! ```no_run
//! let id = fiber::spawn(|| println!("global scheduler")).unwrap();
//! fiber::join(id).unwrap();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      User Code                          │
//! │      spawn(), join(), sleep(), FiberMutex, tokens       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     TaskControl                         │
//! │     slot table, stack pools, parking, group array       │
//! └─────────────────────────────────────────────────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//!  ┌───────────┐      ┌───────────┐      ┌───────────┐
//!  │  Worker   │      │  Worker   │      │   Timer   │
//!  │ TaskGroup │◄────►│ TaskGroup │      │  Thread   │
//!  │ (steals)  │      │ (steals)  │      │           │
//!  └───────────┘      └───────────┘      └───────────┘
//! ```

use std::sync::Arc;

// Core types
pub use fiber_core::{
    FiberAttr, FiberError, FiberId, FiberResult, FiberState, StackClass, TimerId, Token, ESTOP,
};

// Log macros and helpers
pub use fiber_core::flog::{
    init as init_logging, set_flush_enabled, set_log_level, LogLevel,
};
pub use fiber_core::{env_get, env_get_bool, env_get_opt};
pub use fiber_core::{fdebug, ferror, finfo, ftrace, fwarn};

// Runtime surface
pub use fiber_runtime::{
    current_fiber_id, fls_alloc, fls_set, fls_take, fls_with, sleep, sleep_ms, sleep_us,
    yield_now, FiberCond, FiberMutex, FiberMutexGuard, FlsKey, SchedConfig, SchedStats,
    TaskControl, TimerCallback, Unschedule, WaitableEvent,
};

pub mod token;

use fiber_runtime::task_control;

/// Owning handle to a scheduler instance.
///
/// Most processes want the global scheduler (the free functions in
/// this crate); an owned `Runtime` is for embedding, tests, or running
/// several isolated schedulers. Dropping the runtime stops and joins
/// its workers.
pub struct Runtime {
    ctrl: Arc<TaskControl>,
}

impl Runtime {
    /// Build and start a scheduler.
    pub fn new(config: SchedConfig) -> FiberResult<Runtime> {
        let ctrl = TaskControl::new(config)?;
        ctrl.start()?;
        Ok(Runtime { ctrl })
    }

    /// Spawn with default attributes.
    pub fn spawn<F>(&self, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ctrl.spawn(FiberAttr::new(), f)
    }

    /// Spawn with explicit attributes (stack class, no-signal,
    /// never-quit).
    pub fn spawn_with<F>(&self, attr: FiberAttr, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ctrl.spawn(attr, f)
    }

    /// Spawn so the new fiber runs before the spawner continues.
    pub fn spawn_urgent<F>(&self, f: F) -> FiberResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ctrl.spawn_urgent(FiberAttr::new(), f)
    }

    pub fn join(&self, id: FiberId) -> FiberResult<()> {
        self.ctrl.join(id)
    }

    pub fn interrupt(&self, id: FiberId) -> FiberResult<()> {
        self.ctrl.interrupt(id)
    }

    pub fn stop_fiber(&self, id: FiberId) -> FiberResult<()> {
        self.ctrl.stop_fiber(id)
    }

    pub fn add_workers(&self, extra: usize) -> FiberResult<usize> {
        self.ctrl.add_workers(extra)
    }

    pub fn flush_nosignal(&self) -> usize {
        self.ctrl.flush_nosignal()
    }

    pub fn stats(&self) -> SchedStats {
        self.ctrl.stats()
    }

    /// The underlying control, for operations not mirrored here
    /// (timers, existence checks).
    pub fn control(&self) -> &Arc<TaskControl> {
        &self.ctrl
    }

    /// Stop and join workers and the timer thread.
    pub fn shutdown(&self) {
        self.ctrl.stop_and_join();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.ctrl.stop_and_join();
    }
}

/// Spawn on the global scheduler, starting it on first use.
pub fn spawn<F>(f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    task_control::global()?.spawn(FiberAttr::new(), f)
}

/// Spawn on the global scheduler with explicit attributes.
pub fn spawn_with<F>(attr: FiberAttr, f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    task_control::global()?.spawn(attr, f)
}

/// Spawn on the global scheduler so the new fiber runs before the
/// spawner continues.
pub fn spawn_urgent<F>(f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    task_control::global()?.spawn_urgent(FiberAttr::new(), f)
}

/// Wait for a fiber on the global scheduler to finish.
pub fn join(id: FiberId) -> FiberResult<()> {
    task_control::global()?.join(id)
}

/// Interrupt a blocking call in the given fiber.
pub fn interrupt(id: FiberId) -> FiberResult<()> {
    task_control::global()?.interrupt(id)
}

/// Ask a fiber to unwind: stop flag plus interrupt.
pub fn stop_fiber(id: FiberId) -> FiberResult<()> {
    task_control::global()?.stop_fiber(id)
}

/// Whether stop was requested for the calling fiber. Long-running
/// fibers poll this at convenient points.
pub fn stop_requested() -> bool {
    match (current_fiber_id(), task_control::global()) {
        (Some(id), Ok(ctrl)) => ctrl.stop_requested(id),
        _ => false,
    }
}

/// Initialize the global scheduler with an explicit config instead of
/// the lazy environment-driven default.
pub fn init(config: SchedConfig) -> FiberResult<()> {
    fiber_runtime::global_init(config).map(|_| ())
}
