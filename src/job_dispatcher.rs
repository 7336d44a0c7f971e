//! High-level dispatcher interface.
//!
//! The JobDispatcher is the primary entry point for scheduling and managing
//! parallel work. It owns the fiber pools and the worker threads, hands out
//! [`JobHandle`]s for dispatched batches and lets any thread wait on them.

use crate::config::DispatcherConfig;
use crate::counter::JobHandle;
use crate::error::DispatchError;
use crate::job::{Job, PoolClass};
use crate::scheduler::Scheduler;
use crate::thread_data;
use crate::worker::WorkerPool;
use std::sync::Arc;
use tracing::{info, warn};

/// The main dispatcher managing fibers, counters and worker threads.
///
/// Several dispatchers may coexist; each has its own pools and workers.
/// Dropping a dispatcher shuts it down.
pub struct JobDispatcher {
    scheduler: Arc<Scheduler>,
    workers: Option<WorkerPool>,
}

impl JobDispatcher {
    /// Allocates every fiber stack up front and starts the worker threads.
    ///
    /// The calling thread is registered as a main thread: it runs jobs only
    /// while it waits or [`pump`](Self::pump)s.
    ///
    /// # Example
    ///
    /// ```
    /// use fiber_jobs::{DispatcherConfig, JobDispatcher};
    ///
    /// let dispatcher = JobDispatcher::new(DispatcherConfig::with_workers(2)).unwrap();
    /// assert_eq!(dispatcher.num_worker_threads(), 2);
    /// ```
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        let config = config.resolved()?;
        let scheduler = Arc::new(Scheduler::new(&config)?);
        scheduler.register_thread(true)?;

        let num_workers = config.worker_count();
        let workers = WorkerPool::new(Arc::clone(&scheduler), num_workers as usize, config.pinning)
            .inspect_err(|_| thread_data::unregister(scheduler.id()))?;

        info!(
            workers = num_workers,
            small_fibers = config.max_small_fibers,
            big_fibers = config.max_big_fibers,
            pinning = ?config.pinning,
            "job dispatcher initialized"
        );
        Ok(JobDispatcher {
            scheduler,
            workers: Some(workers),
        })
    }

    /// Default configuration with `num_workers` worker threads.
    pub fn with_workers(num_workers: u8) -> Result<Self, DispatchError> {
        Self::new(DispatcherConfig::with_workers(num_workers))
    }

    /// Dispatches a batch of jobs, one fiber per job, all drawn from `class`.
    ///
    /// Jobs that find the pool exhausted are dropped (and logged); the handle
    /// only counts the ones that got a fiber. Each job sees its position in
    /// the batch through [`Context::index`](crate::Context::index).
    ///
    /// Returns `None` when no job counter is free or no job got a fiber.
    ///
    /// # Example
    ///
    /// ```
    /// use fiber_jobs::{Job, JobDispatcher, PoolClass};
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicU32, Ordering};
    ///
    /// let dispatcher = JobDispatcher::with_workers(1).unwrap();
    /// let sum = Arc::new(AtomicU32::new(0));
    /// let jobs = (0..4).map(|_| {
    ///     let sum = sum.clone();
    ///     Job::new(move |ctx| {
    ///         sum.fetch_add(ctx.index(), Ordering::SeqCst);
    ///     })
    /// });
    /// let handle = dispatcher.dispatch(jobs, PoolClass::Small).unwrap();
    /// dispatcher.wait_and_delete(handle).unwrap();
    /// assert_eq!(sum.load(Ordering::SeqCst), 6);
    /// ```
    pub fn dispatch<I>(&self, jobs: I, class: PoolClass) -> Option<JobHandle>
    where
        I: IntoIterator<Item = Job>,
    {
        self.scheduler.dispatch(jobs, class)
    }

    pub fn dispatch_small<I>(&self, jobs: I) -> Option<JobHandle>
    where
        I: IntoIterator<Item = Job>,
    {
        self.dispatch(jobs, PoolClass::Small)
    }

    pub fn dispatch_big<I>(&self, jobs: I) -> Option<JobHandle>
    where
        I: IntoIterator<Item = Job>,
    {
        self.dispatch(jobs, PoolClass::Big)
    }

    /// Blocks until every job counted by `handle` finished, running queued
    /// jobs on this thread meanwhile, then frees the handle.
    ///
    /// Waiting on a handle that was already deleted returns immediately.
    pub fn wait_and_delete(&self, handle: JobHandle) -> Result<(), DispatchError> {
        self.scheduler.wait_and_delete(handle)
    }

    /// Whether every job counted by `handle` has finished.
    pub fn is_done(&self, handle: JobHandle) -> bool {
        self.scheduler.is_done(handle)
    }

    /// Frees a finished handle without waiting.
    ///
    /// A handle whose jobs are still pending is left alone and `false` is
    /// returned.
    pub fn delete(&self, handle: JobHandle) -> bool {
        self.scheduler.delete(handle)
    }

    /// Runs at most one queued job on the calling thread.
    ///
    /// Returns `true` if a job ran. Useful for threads that drive the
    /// dispatcher from their own loop, especially with zero workers.
    pub fn pump(&self) -> bool {
        self.scheduler.pump()
    }

    pub fn num_worker_threads(&self) -> u8 {
        self.scheduler.num_workers()
    }

    /// Fibers of `class` currently free.
    pub fn available_fibers(&self, class: PoolClass) -> usize {
        self.scheduler.pool(class).available()
    }

    pub fn fiber_capacity(&self, class: PoolClass) -> usize {
        self.scheduler.pool(class).capacity()
    }

    /// Job counters not held by a live handle.
    pub fn available_counters(&self) -> usize {
        self.scheduler.counters().available()
    }

    /// Fibers enqueued and not yet claimed by any thread.
    pub fn queued_fibers(&self) -> usize {
        self.scheduler.queued_fibers()
    }

    /// Stops and joins the worker threads.
    ///
    /// Work still queued is abandoned. Returns
    /// [`DispatchError::WorkersPanicked`] if any worker thread panicked.
    pub fn shutdown(mut self) -> Result<(), DispatchError> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<(), DispatchError> {
        let Some(workers) = self.workers.take() else {
            return Ok(());
        };
        let num_workers = workers.size();
        let joined = workers.shutdown();

        let abandoned = self.scheduler.abandon_queued();
        if abandoned > 0 {
            warn!(abandoned, "shutting down with queued fibers, their jobs never ran");
        }
        self.scheduler.retire();
        thread_data::unregister(self.scheduler.id());
        info!(workers = num_workers, "job dispatcher shut down");

        joined.map_err(DispatchError::WorkersPanicked)
    }
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_inner() {
            warn!(error = %err, "job dispatcher shut down with errors");
        }
    }
}
