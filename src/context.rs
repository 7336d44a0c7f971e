//! Context type for safe access to dispatcher capabilities from within jobs.

use crate::counter::JobHandle;
use crate::error::DispatchError;
use crate::job::{Job, PoolClass};
use crate::scheduler::Scheduler;

/// Context provided to every running job.
///
/// Carries the job's index within its dispatched batch and exposes the same
/// dispatch and wait operations as [`JobDispatcher`](crate::JobDispatcher),
/// so a job can fan out further work and wait on it without blocking its
/// worker thread.
pub struct Context<'a> {
    scheduler: &'a Scheduler,
    index: u32,
}

impl<'a> Context<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, index: u32) -> Self {
        Context { scheduler, index }
    }

    /// Position of this job in the batch it was dispatched with.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Dispatches a batch of jobs onto fibers from `class`.
    ///
    /// See [`JobDispatcher::dispatch`](crate::JobDispatcher::dispatch).
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

    /// Suspends this job until every job counted by `handle` has finished,
    /// then frees the handle. The worker thread keeps running other jobs in
    /// the meantime.
    ///
    /// Fails with [`DispatchError::WaitStacksExhausted`] when this thread
    /// already has the maximum number of waits in flight. The handle is left
    /// untouched in that case.
    pub fn wait_and_delete(&self, handle: JobHandle) -> Result<(), DispatchError> {
        self.scheduler.wait_and_delete(handle)
    }

    pub fn is_done(&self, handle: JobHandle) -> bool {
        self.scheduler.is_done(handle)
    }

    /// Frees a finished handle without waiting. Refused while jobs are pending.
    pub fn delete(&self, handle: JobHandle) -> bool {
        self.scheduler.delete(handle)
    }

    pub fn num_worker_threads(&self) -> u8 {
        self.scheduler.num_workers()
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
