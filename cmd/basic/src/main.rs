//! Basic fiber example
//!
//! Spawns a handful of fibers over a few workers, shows yielding,
//! sleeping, urgent spawns and fiber-local storage.
//!
//! # Environment Variables
//!
//! - `FIBER_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `FIBER_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//!
// FIBER_LOG_LEVEL=debug FIBER_FLUSH_EPRINT=1 cargo run -p fiber-basic

use fiber::{fdebug, finfo};
use fiber::{FiberAttr, Runtime, SchedConfig, StackClass};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    println!("=== Fiber Basic Example ===\n");

    fiber::init_logging();

    let config = SchedConfig::from_env().with_num_workers(4);
    let rt = Runtime::new(config).expect("scheduler start");

    finfo!("spawning fibers on {} workers", rt.stats().workers);

    let mut ids = Vec::new();
    for i in 1..=3 {
        let id = rt
            .spawn(move || {
                fdebug!("[fiber {}] started", i);
                for j in 0..3 {
                    fdebug!("[fiber {}] iteration {}", i, j);
                    fiber::yield_now();
                }
                fiber::sleep(Duration::from_millis(10)).unwrap();
                fdebug!("[fiber {}] finished", i);
            })
            .expect("spawn");
        println!("Spawned fiber {} (id={})", i, id);
        ids.push(id);
    }

    // A small-stack fiber that records something in fiber-local storage
    let key = fiber::fls_alloc();
    let attr = FiberAttr::new().with_stack_class(StackClass::Small);
    let small = rt
        .spawn_with(attr, move || {
            fiber::fls_set(key, String::from("small-stack fiber"));
            fiber::yield_now();
            let name = fiber::fls_with(key, |v: Option<&mut String>| v.cloned());
            fdebug!("fls says: {:?}", name);
        })
        .expect("spawn");
    ids.push(small);

    // An urgent spawn from inside a fiber runs before its spawner resumes
    let log = Arc::new(fiber::FiberMutex::new(Vec::new()));
    let outer = Arc::clone(&log);
    let ctrl = Arc::clone(rt.control());
    let parent = rt
        .spawn(move || {
            outer.lock().push("parent: before urgent spawn");
            let inner = Arc::clone(&outer);
            let child = ctrl
                .spawn_urgent(FiberAttr::new(), move || {
                    inner.lock().push("child: running");
                })
                .expect("spawn_urgent");
            outer.lock().push("parent: resumed");
            ctrl.join(child).unwrap();
        })
        .expect("spawn");
    ids.push(parent);

    println!("\nWaiting for {} fibers...\n", ids.len());
    for id in ids {
        rt.join(id).expect("join");
    }

    for line in log.lock().iter() {
        println!("  {}", line);
    }

    let stats = rt.stats();
    finfo!(
        "done: {} spawned, {} finished, {} stacks cached",
        stats.spawned,
        stats.finished,
        stats.cached_stacks
    );

    println!("\n=== Example Complete ===");
}
