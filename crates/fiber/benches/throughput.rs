//! Scheduler throughput benchmarks.
//!
//! Spawn/join batches, yield churn and mutex contention, run against a
//! private runtime so the global scheduler stays untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fiber::{FiberAttr, FiberMutex, Runtime, SchedConfig, StackClass};

const BATCH: usize = 1000;

fn runtime(workers: usize) -> Runtime {
    Runtime::new(
        SchedConfig::default()
            .with_num_workers(workers)
            .with_max_fibers(BATCH * 2)
            .with_park_timeout(Duration::from_millis(1)),
    )
    .unwrap()
}

fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_join");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.sample_size(20);

    for workers in [1usize, 2, 4] {
        let rt = runtime(workers);
        let attr = FiberAttr::new().with_stack_class(StackClass::Small);
        group.bench_function(BenchmarkId::new("batch_1k", workers), |b| {
            b.iter(|| {
                let count = Arc::new(AtomicUsize::new(0));
                let mut ids = Vec::with_capacity(BATCH);
                for _ in 0..BATCH {
                    let count = Arc::clone(&count);
                    ids.push(
                        rt.spawn_with(attr, move || {
                            count.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap(),
                    );
                }
                for id in ids {
                    rt.join(id).unwrap();
                }
                assert_eq!(count.load(Ordering::Relaxed), BATCH);
            })
        });
    }
    group.finish();
}

fn bench_yield_churn(c: &mut Criterion) {
    const YIELDS: usize = 10_000;
    let rt = runtime(1);

    let mut group = c.benchmark_group("context_switch");
    group.throughput(Throughput::Elements(YIELDS as u64));
    group.sample_size(20);

    // Two fibers ping-ponging on one worker: every yield is a full
    // save/restore pair through the scheduler context
    group.bench_function("yield_pair_10k", |b| {
        b.iter(|| {
            let mut ids = Vec::new();
            for _ in 0..2 {
                ids.push(
                    rt.spawn(|| {
                        for _ in 0..YIELDS / 2 {
                            fiber::yield_now();
                        }
                    })
                    .unwrap(),
                );
            }
            for id in ids {
                rt.join(id).unwrap();
            }
        })
    });
    group.finish();
}

fn bench_mutex_contention(c: &mut Criterion) {
    const FIBERS: usize = 32;
    const PER_FIBER: usize = 250;
    let rt = runtime(4);

    let mut group = c.benchmark_group("mutex");
    group.throughput(Throughput::Elements((FIBERS * PER_FIBER) as u64));
    group.sample_size(20);

    group.bench_function("contended_counter", |b| {
        b.iter(|| {
            let counter = Arc::new(FiberMutex::new(0usize));
            let mut ids = Vec::with_capacity(FIBERS);
            for _ in 0..FIBERS {
                let counter = Arc::clone(&counter);
                ids.push(
                    rt.spawn(move || {
                        for _ in 0..PER_FIBER {
                            *counter.lock() += 1;
                        }
                    })
                    .unwrap(),
                );
            }
            for id in ids {
                rt.join(id).unwrap();
            }
            assert_eq!(*counter.lock(), FIBERS * PER_FIBER);
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_spawn_join,
    bench_yield_churn,
    bench_mutex_contention
);
criterion_main!(benches);
