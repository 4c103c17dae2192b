//! Stress test - many fibers
//!
//! Spawns a large number of small-stack fibers, lets them churn
//! through yields and short sleeps, and reports throughput.

use fiber::{FiberAttr, Runtime, SchedConfig, StackClass};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("=== Fiber Stress Test ===\n");

    let num_fibers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);

    println!("Spawning {} fibers...", num_fibers);

    let config = SchedConfig::from_env()
        .with_num_workers(8)
        .with_max_fibers(num_fibers + 1000);
    let rt = Runtime::new(config).expect("scheduler start");

    let completed = Arc::new(AtomicU64::new(0));
    let attr = FiberAttr::new()
        .with_stack_class(StackClass::Small)
        .no_signal();

    let start = Instant::now();
    let mut ids = Vec::with_capacity(num_fibers);
    for i in 0..num_fibers {
        let completed = Arc::clone(&completed);
        let id = rt
            .spawn_with(attr, move || {
                for _ in 0..10 {
                    fiber::yield_now();
                }
                if i % 100 == 0 {
                    let _ = fiber::sleep(Duration::from_millis(1));
                }
                completed.fetch_add(1, Ordering::Relaxed);
            })
            .expect("spawn");
        ids.push(id);

        if (i + 1) % 1000 == 0 {
            print!("\rSpawned: {}/{}", i + 1, num_fibers);
        }
    }
    // Batch spawn used no_signal; one flush wakes the workers
    rt.flush_nosignal();

    let spawn_time = start.elapsed();
    println!("\n\nSpawn time: {:?}", spawn_time);
    println!(
        "Spawn rate: {:.0} fibers/sec",
        num_fibers as f64 / spawn_time.as_secs_f64()
    );

    println!("\nWaiting for completion...");
    let run_start = Instant::now();
    for id in ids {
        rt.join(id).expect("join");
    }

    let total_time = start.elapsed();
    let run_time = run_start.elapsed();
    let stats = rt.stats();

    println!("\n=== Results ===");
    println!("Total fibers:  {}", num_fibers);
    println!("Completed:     {}", completed.load(Ordering::Relaxed));
    println!("Spawn time:    {:?}", spawn_time);
    println!("Run time:      {:?}", run_time);
    println!("Total time:    {:?}", total_time);
    println!(
        "Throughput:    {:.0} fibers/sec",
        num_fibers as f64 / total_time.as_secs_f64()
    );
    println!("Timers fired:  {}", stats.timers_fired);
    println!("Stacks cached: {}", stats.cached_stacks);

    println!("\n=== Stress Test Complete ===");
}
