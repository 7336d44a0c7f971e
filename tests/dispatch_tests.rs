use fiber_jobs::{DispatcherConfig, Job, JobDispatcher, PoolClass};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn counting_jobs(n: usize, hits: &Arc<AtomicUsize>) -> Vec<Job> {
    (0..n)
        .map(|_| {
            let hits = hits.clone();
            Job::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect()
}

#[test]
fn test_dispatch_and_wait() {
    let dispatcher = JobDispatcher::with_workers(2).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let handle = dispatcher
        .dispatch(counting_jobs(10, &hits), PoolClass::Small)
        .unwrap();
    dispatcher.wait_and_delete(handle).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 10);
    dispatcher.shutdown().expect("Shutdown failed");
}

#[test]
fn test_is_done_after_wait() {
    let dispatcher = JobDispatcher::with_workers(1).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counters = dispatcher.available_counters();

    let handle = dispatcher.dispatch_big(counting_jobs(3, &hits)).unwrap();
    assert_eq!(dispatcher.available_counters(), counters - 1);
    dispatcher.wait_and_delete(handle).unwrap();

    assert!(dispatcher.is_done(handle));
    assert_eq!(dispatcher.available_counters(), counters);
    assert_eq!(dispatcher.available_fibers(PoolClass::Big), 32);
}

#[test]
fn test_job_index_within_batch() {
    let dispatcher = JobDispatcher::with_workers(2).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));

    let jobs = (0..8).map(|i| {
        let seen = seen.clone();
        Job::new(move |ctx| {
            assert_eq!(ctx.index(), i);
            seen.fetch_or(1 << i, Ordering::SeqCst);
        })
    });
    let handle = dispatcher.dispatch_small(jobs).unwrap();
    dispatcher.wait_and_delete(handle).unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0xff);
}

#[test]
fn test_empty_batch_returns_none() {
    let dispatcher = JobDispatcher::with_workers(0).unwrap();
    let counters = dispatcher.available_counters();

    assert!(dispatcher.dispatch_small(Vec::new()).is_none());
    assert_eq!(dispatcher.available_counters(), counters);
}

#[test]
fn test_pool_exhaustion_drops_excess_jobs() {
    let config = DispatcherConfig {
        max_small_fibers: 4,
        ..DispatcherConfig::with_workers(0)
    };
    let dispatcher = JobDispatcher::new(config).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let handle = dispatcher.dispatch_small(counting_jobs(10, &hits)).unwrap();
    assert_eq!(dispatcher.available_fibers(PoolClass::Small), 0);
    assert_eq!(dispatcher.queued_fibers(), 4);
    dispatcher.wait_and_delete(handle).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(dispatcher.available_fibers(PoolClass::Small), 4);
}

#[test]
fn test_exhausted_pool_returns_none() {
    let config = DispatcherConfig {
        max_small_fibers: 2,
        ..DispatcherConfig::with_workers(0)
    };
    let dispatcher = JobDispatcher::new(config).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counters = dispatcher.available_counters();

    let first = dispatcher.dispatch_small(counting_jobs(2, &hits)).unwrap();
    // No fiber left: the counter taken for the batch is given back.
    assert!(dispatcher.dispatch_small(counting_jobs(1, &hits)).is_none());
    assert_eq!(dispatcher.available_counters(), counters - 1);

    dispatcher.wait_and_delete(first).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_counter_exhaustion() {
    let config = DispatcherConfig {
        max_small_fibers: 1,
        max_big_fibers: 1,
        ..DispatcherConfig::with_workers(0)
    };
    let dispatcher = JobDispatcher::new(config).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    assert_eq!(dispatcher.available_counters(), 2);

    let a = dispatcher.dispatch_small(counting_jobs(1, &hits)).unwrap();
    let b = dispatcher.dispatch_big(counting_jobs(1, &hits)).unwrap();
    assert!(dispatcher.dispatch_small(counting_jobs(1, &hits)).is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    dispatcher.wait_and_delete(a).unwrap();
    dispatcher.wait_and_delete(b).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Freed counters are reusable.
    let c = dispatcher.dispatch_small(counting_jobs(1, &hits)).unwrap();
    dispatcher.wait_and_delete(c).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn test_three_jobs_one_fans_out() {
    let dispatcher = JobDispatcher::with_workers(2).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let jobs = (0..3).map(|_| {
        let hits = hits.clone();
        Job::new(move |ctx| {
            hits.fetch_add(1, Ordering::SeqCst);
            if ctx.index() == 2 {
                let children = counting_jobs(2, &hits);
                let handle = ctx.dispatch_small(children).unwrap();
                ctx.wait_and_delete(handle).unwrap();
                assert!(ctx.is_done(handle));
            }
        })
    });
    let handle = dispatcher.dispatch_small(jobs).unwrap();
    dispatcher.wait_and_delete(handle).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 5);
    assert!(dispatcher.is_done(handle));
    assert_eq!(dispatcher.available_fibers(PoolClass::Small), 128);
}

#[test]
fn test_independent_dispatchers() {
    let first = JobDispatcher::with_workers(1).unwrap();
    let second = JobDispatcher::with_workers(0).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let a = first.dispatch_small(counting_jobs(4, &hits)).unwrap();
    let b = second.dispatch_small(counting_jobs(4, &hits)).unwrap();
    second.wait_and_delete(b).unwrap();
    first.wait_and_delete(a).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 8);
    assert_eq!(second.num_worker_threads(), 0);
}
