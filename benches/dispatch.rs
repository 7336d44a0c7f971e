//! Dispatch throughput benchmark using criterion.
//!
//! Measures dispatch-plus-wait of full small-pool batches of empty jobs,
//! with and without worker threads helping the waiting thread.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fiber_jobs::{Job, JobDispatcher, PoolClass};

const BATCH: usize = 128;

fn empty_batch() -> Vec<Job> {
    (0..BATCH)
        .map(|_| {
            Job::new(|_| {
                std::hint::black_box(1 + 1);
            })
        })
        .collect()
}

fn bench_dispatch_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(BATCH as u64));

    for workers in [0u8, 1, 3] {
        let dispatcher = JobDispatcher::with_workers(workers).unwrap();
        group.bench_function(BenchmarkId::new("small_batch", workers), |b| {
            b.iter_batched(
                empty_batch,
                |jobs| {
                    let handle = dispatcher.dispatch(jobs, PoolClass::Small).unwrap();
                    dispatcher.wait_and_delete(handle).unwrap();
                },
                criterion::BatchSize::SmallInput,
            );
        });
        dispatcher.shutdown().unwrap();
    }

    group.finish();
}

fn bench_single_job_latency(c: &mut Criterion) {
    let dispatcher = JobDispatcher::with_workers(1).unwrap();

    c.bench_function("dispatch_single_job", |b| {
        b.iter(|| {
            let handle = dispatcher.dispatch_small([Job::new(|_| {})]).unwrap();
            dispatcher.wait_and_delete(handle).unwrap();
        });
    });

    dispatcher.shutdown().unwrap();
}

criterion_group!(benches, bench_dispatch_batch, bench_single_job_latency);
criterion_main!(benches);
