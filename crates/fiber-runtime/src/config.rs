//! Scheduler configuration
//!
//! Defaults come from the host (worker count from available
//! parallelism) and can be overridden either through the builder
//! methods or environment variables:
//!
//! - `FIBER_NUM_WORKERS` - initial worker thread count
//! - `FIBER_MAX_FIBERS` - fiber slot table size
//! - `FIBER_IDLE_SPINS` - busy-poll rounds before a worker parks
//! - `FIBER_PARK_TIMEOUT_MS` - worker park backstop in milliseconds
//! - `FIBER_STACK_POOL_CAP` - pooled stacks kept per size class
//! - `FIBER_TIMER_BUCKETS` - timer heap shard count

use std::time::Duration;

use fiber_core::constants::{DEFAULT_MAX_FIBERS, MAX_WORKERS, TIMER_BUCKETS};
use fiber_core::{env_get, FiberError, FiberResult};

/// Tunables for a [`TaskControl`](crate::task_control::TaskControl).
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Initial worker thread count
    pub num_workers: usize,

    /// Fiber slot table size (hard cap on concurrent fibers)
    pub max_fibers: usize,

    /// Busy-poll rounds before an idle worker parks
    pub idle_spins: u32,

    /// Park backstop: parked workers re-check queues at this interval
    /// even without a wakeup, so a lost signal costs latency, not a hang
    pub park_timeout: Duration,

    /// Stacks kept cached per size class
    pub stack_pool_capacity: usize,

    /// Timer heap shard count
    pub timer_buckets: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        SchedConfig {
            num_workers: cpus.min(MAX_WORKERS),
            max_fibers: DEFAULT_MAX_FIBERS,
            idle_spins: 64,
            park_timeout: Duration::from_millis(100),
            stack_pool_capacity: 64,
            timer_buckets: TIMER_BUCKETS,
        }
    }
}

impl SchedConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let d = SchedConfig::default();
        SchedConfig {
            num_workers: env_get("FIBER_NUM_WORKERS", d.num_workers),
            max_fibers: env_get("FIBER_MAX_FIBERS", d.max_fibers),
            idle_spins: env_get("FIBER_IDLE_SPINS", d.idle_spins),
            park_timeout: Duration::from_millis(env_get(
                "FIBER_PARK_TIMEOUT_MS",
                d.park_timeout.as_millis() as u64,
            )),
            stack_pool_capacity: env_get("FIBER_STACK_POOL_CAP", d.stack_pool_capacity),
            timer_buckets: env_get("FIBER_TIMER_BUCKETS", d.timer_buckets),
        }
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_max_fibers(mut self, n: usize) -> Self {
        self.max_fibers = n;
        self
    }

    pub fn with_park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    /// Check bounds before the scheduler commits resources to them.
    pub fn validate(&self) -> FiberResult<()> {
        if self.num_workers == 0 || self.num_workers > MAX_WORKERS {
            return Err(FiberError::NoResource);
        }
        if self.max_fibers == 0 || self.max_fibers > u32::MAX as usize / 2 {
            return Err(FiberError::NoResource);
        }
        if self.timer_buckets == 0 {
            return Err(FiberError::NoResource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(SchedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let cfg = SchedConfig::default().with_num_workers(0);
        assert_eq!(cfg.validate(), Err(FiberError::NoResource));
        let cfg = SchedConfig::default().with_num_workers(MAX_WORKERS + 1);
        assert_eq!(cfg.validate(), Err(FiberError::NoResource));
    }

    #[test]
    fn test_builder() {
        let cfg = SchedConfig::default()
            .with_num_workers(2)
            .with_max_fibers(128)
            .with_park_timeout(Duration::from_millis(5));
        assert_eq!(cfg.num_workers, 2);
        assert_eq!(cfg.max_fibers, 128);
        assert_eq!(cfg.park_timeout, Duration::from_millis(5));
    }
}
