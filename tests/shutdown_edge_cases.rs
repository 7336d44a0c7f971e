use fiber_jobs::{DispatcherConfig, Job, JobDispatcher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_shutdown_idle() {
    let dispatcher = JobDispatcher::with_workers(4).unwrap();
    dispatcher.shutdown().expect("Shutdown failed");
}

#[test]
fn test_shutdown_without_workers_abandons_queue() {
    let dispatcher = JobDispatcher::with_workers(0).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let jobs = (0..5).map(|_| {
        let hits = hits.clone();
        Job::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    });
    dispatcher.dispatch_small(jobs).unwrap();
    assert_eq!(dispatcher.queued_fibers(), 5);

    dispatcher.shutdown().expect("Shutdown failed");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_shutdown_with_pending_work() {
    let dispatcher = JobDispatcher::with_workers(2).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let jobs = (0..64).map(|_| {
        let hits = hits.clone();
        Job::new(move |_| {
            std::thread::sleep(Duration::from_millis(1));
            hits.fetch_add(1, Ordering::SeqCst);
        })
    });
    dispatcher.dispatch_small(jobs).unwrap();

    // Workers finish the job in hand and stop; the rest is dropped.
    dispatcher.shutdown().expect("Shutdown failed");
    assert!(hits.load(Ordering::SeqCst) <= 64);
}

#[test]
fn test_shutdown_while_parent_waits() {
    let dispatcher = JobDispatcher::with_workers(2).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    dispatcher
        .dispatch_big([Job::new(move |ctx| {
            let children = (0..16).map(|_| {
                let h = h.clone();
                Job::new(move |_| {
                    std::thread::sleep(Duration::from_millis(1));
                    h.fetch_add(1, Ordering::SeqCst);
                })
            });
            let inner = ctx.dispatch_small(children).unwrap();
            ctx.wait_and_delete(inner).unwrap();
        })])
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));

    // A worker inside a nested wait drains the children it waits on.
    dispatcher.shutdown().expect("Shutdown failed");
}

#[test]
fn test_drop_without_shutdown() {
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let dispatcher = JobDispatcher::new(DispatcherConfig::with_workers(3)).unwrap();
        let h = hits.clone();
        let handle = dispatcher
            .dispatch_small([Job::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })])
            .unwrap();
        dispatcher.wait_and_delete(handle).unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rapid_create_and_shutdown() {
    for workers in [0, 1, 2, 4] {
        let dispatcher = JobDispatcher::with_workers(workers).unwrap();
        assert_eq!(dispatcher.num_worker_threads(), workers);
        dispatcher.shutdown().expect("Shutdown failed");
    }
}
