//! Timer thread
//!
//! One dedicated OS thread drives all deadlines: wait timeouts, sleeps
//! and user timers. Tasks are sharded across spinlocked min-heaps by
//! id, so schedulers under load spread their insert contention; the
//! thread scans all shards, fires what is due in deadline order, then
//! sleeps on a condvar until the nearest remaining deadline.
//!
//! Timer ids come from a monotonic counter and are never reused, so
//! unschedule can always tell a finished task from a live one.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fiber_core::{fdebug, ftrace, FiberError, FiberResult, SpinLock, TimerId};

pub type TimerCallback = Box<dyn FnOnce() + Send>;

const STATE_SCHEDULED: u32 = 0;
const STATE_RUNNING: u32 = 1;
const STATE_DONE: u32 = 2;
const STATE_CANCELED: u32 = 3;

/// Outcome of [`TimerThread::unschedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unschedule {
    /// Canceled before firing; the callback will never run
    Removed,
    /// The callback is executing right now
    Running,
    /// Unknown id: never scheduled, already fired, or already canceled
    NotFound,
}

struct TimerTask {
    id: u64,
    run_at: Instant,
    state: AtomicU32,
    callback: SpinLock<Option<TimerCallback>>,
}

struct HeapEntry {
    run_at: Instant,
    seq: u64,
    task: Arc<TimerTask>,
}

// BinaryHeap is a max-heap; reverse the ordering for earliest-first
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

struct TimerInner {
    buckets: Box<[SpinLock<BinaryHeap<HeapEntry>>]>,
    /// Live tasks by id, for unschedule
    index: SpinLock<HashMap<u64, Arc<TimerTask>>>,
    next_id: AtomicU64,
    /// Earliest known deadline; the run loop sleeps on this
    nearest: Mutex<Option<Instant>>,
    cond: Condvar,
    stopping: AtomicBool,
    nfired: AtomicU64,
    ncanceled: AtomicU64,
}

pub struct TimerThread {
    inner: Arc<TimerInner>,
    handle: SpinLock<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub fn new(buckets: usize) -> Self {
        let buckets = (0..buckets.max(1))
            .map(|_| SpinLock::new(BinaryHeap::new()))
            .collect();
        TimerThread {
            inner: Arc::new(TimerInner {
                buckets,
                index: SpinLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                nearest: Mutex::new(None),
                cond: Condvar::new(),
                stopping: AtomicBool::new(false),
                nfired: AtomicU64::new(0),
                ncanceled: AtomicU64::new(0),
            }),
            handle: SpinLock::new(None),
        }
    }

    /// Spawn the timer thread. Callable once.
    pub fn start(&self) -> FiberResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(FiberError::AlreadyInitialized);
        }
        let inner = Arc::clone(&self.inner);
        let h = std::thread::Builder::new()
            .name("fiber-timer".into())
            .spawn(move || inner.run())
            .map_err(|_| FiberError::NoResource)?;
        *handle = Some(h);
        Ok(())
    }

    /// Register `callback` to run at `run_at`. Callbacks fire in
    /// deadline order on the timer thread and must not block for long.
    pub fn schedule(&self, run_at: Instant, callback: TimerCallback) -> TimerId {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = Arc::new(TimerTask {
            id,
            run_at,
            state: AtomicU32::new(STATE_SCHEDULED),
            callback: SpinLock::new(Some(callback)),
        });
        inner.index.lock().insert(id, Arc::clone(&task));
        inner.buckets[id as usize % inner.buckets.len()]
            .lock()
            .push(HeapEntry {
                run_at,
                seq: id,
                task,
            });

        // Re-arm the sleeper if this deadline is the new nearest
        let mut nearest = inner.nearest.lock().unwrap();
        if nearest.map_or(true, |t| run_at < t) {
            *nearest = Some(run_at);
            inner.cond.notify_one();
        }
        TimerId(id)
    }

    /// Cancel a scheduled task. `Removed` guarantees the callback never
    /// runs; `Running` means it is firing concurrently.
    pub fn unschedule(&self, id: TimerId) -> Unschedule {
        let inner = &self.inner;
        let task = inner.index.lock().get(&id.0).cloned();
        let task = match task {
            Some(t) => t,
            None => return Unschedule::NotFound,
        };
        if task
            .state
            .compare_exchange(
                STATE_SCHEDULED,
                STATE_CANCELED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            // Drop the payload now; the heap entry is skipped when the
            // run loop reaches it
            task.callback.lock().take();
            inner.index.lock().remove(&id.0);
            inner.ncanceled.fetch_add(1, Ordering::Relaxed);
            Unschedule::Removed
        } else if task.state.load(Ordering::Acquire) == STATE_RUNNING {
            Unschedule::Running
        } else {
            Unschedule::NotFound
        }
    }

    /// Fired-callback count.
    pub fn fired(&self) -> u64 {
        self.inner.nfired.load(Ordering::Relaxed)
    }

    pub fn stop_and_join(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        {
            let _guard = self.inner.nearest.lock().unwrap();
            self.inner.cond.notify_one();
        }
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
        fdebug!(
            "timer thread stopped: {} fired, {} canceled",
            self.inner.nfired.load(Ordering::Relaxed),
            self.inner.ncanceled.load(Ordering::Relaxed)
        );
    }
}

impl TimerInner {
    fn run(self: Arc<Self>) {
        ftrace!("timer thread running with {} buckets", self.buckets.len());
        while !self.stopping.load(Ordering::Acquire) {
            // Clear the armed deadline before scanning; schedules that
            // land mid-scan re-arm it and are merged below
            {
                *self.nearest.lock().unwrap() = None;
            }

            let now = Instant::now();
            let mut due: Vec<Arc<TimerTask>> = Vec::new();
            let mut next: Option<Instant> = None;
            for bucket in self.buckets.iter() {
                let mut heap = bucket.lock();
                while let Some(entry) = heap.peek() {
                    if entry.run_at > now {
                        let t = entry.run_at;
                        next = Some(next.map_or(t, |n| n.min(t)));
                        break;
                    }
                    let entry = heap.pop().unwrap();
                    if entry.task.state.load(Ordering::Acquire) == STATE_SCHEDULED {
                        due.push(entry.task);
                    }
                }
            }

            due.sort_by_key(|t| (t.run_at, t.id));
            for task in due {
                if task
                    .state
                    .compare_exchange(
                        STATE_SCHEDULED,
                        STATE_RUNNING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    continue;
                }
                let callback = task.callback.lock().take();
                if let Some(cb) = callback {
                    cb();
                }
                task.state.store(STATE_DONE, Ordering::Release);
                self.index.lock().remove(&task.id);
                self.nfired.fetch_add(1, Ordering::Relaxed);
            }

            let mut nearest = self.nearest.lock().unwrap();
            *nearest = match (*nearest, next) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let wait_for = match *nearest {
                Some(t) => {
                    let now = Instant::now();
                    if t <= now {
                        continue;
                    }
                    t - now
                }
                // Idle backstop; a schedule() notify cuts this short
                None => Duration::from_millis(100),
            };
            let _ = self.cond.wait_timeout(nearest, wait_for);
        }
        ftrace!("timer thread exiting");
    }
}
