//! Shared scheduler state and the scheduling loop.
//!
//! One `Scheduler` sits behind every [`JobDispatcher`](crate::JobDispatcher)
//! and is shared by its worker threads. It owns the fiber pools, the counter
//! pool, the wait lists and the semaphore that counts enqueued fibers.
//!
//! Waiting inside a job never blocks the OS thread. The waiting fiber is put
//! back on the wait lists, pinned to its thread, and a fresh scheduler context
//! is started on one of the thread's spare wait stacks. That context keeps
//! running other work until it can take the waiting fiber back, and then
//! simply returns into the wait call.

use crate::config::DispatcherConfig;
use crate::context::Context;
use crate::counter::{CounterPool, Decrement, JobHandle};
use crate::error::DispatchError;
use crate::fiber::{FiberId, FiberInput, FiberState, JobRunner, panic_message};
use crate::fiber_pool::FiberPool;
use crate::job::{Job, PoolClass};
use crate::stack::StackPool;
use crate::sync::{CompletionSignal, Semaphore};
use crate::thread_data::{self, ThreadData};
use crate::wait_list::{Claim, WaitEntry, WaitLists};

use corosensei::Coroutine;
use corosensei::stack::DefaultStack;
use crossbeam::utils::Backoff;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Longest a stalled thread parks before scanning again.
const STALL_PARK: Duration = Duration::from_millis(1);

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Which loop a scheduler context is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Bottom of a worker thread; runs until shutdown.
    Root,
    /// Started by a nested wait; returns once its waiter may continue.
    Nested,
}

pub(crate) struct Scheduler {
    id: u64,
    small: FiberPool,
    big: FiberPool,
    counters: CounterPool,
    wait_lists: WaitLists,
    /// One permit per enqueued fiber not yet claimed.
    ready: Semaphore,
    completions: CompletionSignal,
    stop: AtomicBool,
    /// Shared with every registered thread; set once the dispatcher is gone.
    retired: Arc<AtomicBool>,
    next_thread_id: AtomicU32,
    num_workers: u8,
    wait_stacks_per_thread: usize,
    wait_stack_size: usize,
}

impl Scheduler {
    /// Allocates both fiber pools and the counter pool for a resolved config.
    pub(crate) fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let big = FiberPool::new(PoolClass::Big, config.max_big_fibers, config.big_stack_size)?;
        let small = FiberPool::new(
            PoolClass::Small,
            config.max_small_fibers,
            config.small_stack_size,
        )?;
        for pool in [&small, &big] {
            debug!(
                class = ?pool.class(),
                count = pool.capacity(),
                stack_kb = pool.stack_size() / 1024,
                "fiber pool created"
            );
        }
        let counters =
            CounterPool::new(config.max_small_fibers as usize + config.max_big_fibers as usize);

        Ok(Scheduler {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            small,
            big,
            counters,
            wait_lists: WaitLists::new(),
            ready: Semaphore::new(),
            completions: CompletionSignal::new(),
            stop: AtomicBool::new(false),
            retired: Arc::new(AtomicBool::new(false)),
            next_thread_id: AtomicU32::new(1),
            num_workers: config.worker_count(),
            wait_stacks_per_thread: config.wait_stacks_per_thread,
            wait_stack_size: config.wait_stack_size,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn num_workers(&self) -> u8 {
        self.num_workers
    }

    pub(crate) fn pool(&self, class: PoolClass) -> &FiberPool {
        match class {
            PoolClass::Small => &self.small,
            PoolClass::Big => &self.big,
        }
    }

    pub(crate) fn counters(&self) -> &CounterPool {
        &self.counters
    }

    pub(crate) fn queued_fibers(&self) -> usize {
        self.wait_lists.len()
    }

    /// Creates and installs this thread's scheduling state.
    pub(crate) fn register_thread(&self, is_main: bool) -> Result<Rc<ThreadData>, DispatchError> {
        let stacks = StackPool::new(self.wait_stacks_per_thread, self.wait_stack_size)?;
        let thread_id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        Ok(thread_data::register(ThreadData::new(
            self.id,
            Arc::clone(&self.retired),
            thread_id,
            is_main,
            stacks,
        )))
    }

    /// This thread's state, registering it as a pumping thread on first use.
    fn current_thread(&self) -> Result<Rc<ThreadData>, DispatchError> {
        match thread_data::current(self.id) {
            Some(thread) => Ok(thread),
            None => {
                debug!(scheduler = self.id, "registering pumping thread");
                self.register_thread(true)
            }
        }
    }

    /// Creates one fiber per job and enqueues them.
    ///
    /// Jobs that find the pool exhausted are dropped; the counter only counts
    /// the fibers that were created. Returns `None` when no counter is free or
    /// no fiber could be created.
    pub(crate) fn dispatch<I>(&self, jobs: I, class: PoolClass) -> Option<JobHandle>
    where
        I: IntoIterator<Item = Job>,
    {
        let Some(handle) = self.counters.allocate() else {
            warn!(
                max = self.counters.capacity(),
                "exceeded maximum job counters, dispatch dropped"
            );
            return None;
        };

        let pool = self.pool(class);
        let mut entries = Vec::new();
        let mut dropped = 0usize;
        for (index, job) in jobs.into_iter().enumerate() {
            let priority = job.priority();
            match pool.new_fiber(job, index as u32, handle) {
                Some(fiber) => entries.push(WaitEntry::fresh(fiber, priority)),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!(
                class = ?pool.class(),
                max = pool.capacity(),
                dropped,
                "exceeded maximum fibers, jobs dropped"
            );
        }
        if entries.is_empty() {
            self.counters.release(handle);
            return None;
        }

        let created = entries.len();
        self.counters.arm(handle, created as u32);
        self.wait_lists.push_batch(entries);
        self.ready.post(created);
        Some(handle)
    }

    pub(crate) fn is_done(&self, handle: JobHandle) -> bool {
        self.counters.is_done(handle)
    }

    /// Frees a completed handle. A handle still counting is left alone.
    pub(crate) fn delete(&self, handle: JobHandle) -> bool {
        if !self.counters.is_done(handle) {
            warn!(?handle, "refusing to delete a job that is still running");
            return false;
        }
        self.counters.release(handle)
    }

    /// Waits until every job counted by `handle` finished, then frees it.
    pub(crate) fn wait_and_delete(&self, handle: JobHandle) -> Result<(), DispatchError> {
        if !self.counters.is_done(handle) {
            let thread = self.current_thread()?;
            match thread.running() {
                Some(fiber) => self.wait_nested(&thread, fiber, handle)?,
                None => self.wait_pumping(&thread, handle),
            }
        }
        if !self.counters.release(handle) {
            debug!(?handle, "waited on a handle that was already deleted");
        }
        Ok(())
    }

    /// Thread-level wait: keep pumping until the counter drains.
    fn wait_pumping(&self, thread: &ThreadData, handle: JobHandle) {
        let backoff = Backoff::new();
        while !self.counters.is_done(handle) {
            let epoch = self.completions.epoch();
            if self.pump_with(thread) {
                backoff.reset();
                continue;
            }
            if !self.counters.is_done(handle) {
                self.stall(&backoff, epoch);
            }
        }
    }

    /// Suspends the running fiber without blocking the thread.
    fn wait_nested(
        &self,
        thread: &Rc<ThreadData>,
        fiber: FiberId,
        handle: JobHandle,
    ) -> Result<(), DispatchError> {
        let Some(stack) = thread.take_wait_stack() else {
            let max = thread.max_wait_stacks();
            warn!(max, "maximum wait stacks exceeded, cannot wait");
            return Err(DispatchError::WaitStacksExhausted { max });
        };
        let Some(slot) = self.pool(fiber.class).get(fiber) else {
            error!(?fiber, "running fiber is not live");
            thread.return_wait_stack(stack);
            return Ok(());
        };
        // SAFETY: the running fiber belongs to this thread.
        let priority = unsafe { slot.meta() }.map(|meta| meta.priority).unwrap_or_default();

        slot.set_state(FiberState::Blocked);
        thread.set_running(None);
        thread.push_waiter(fiber);
        self.wait_lists.push(WaitEntry::suspended(
            fiber,
            priority,
            thread.thread_id(),
            handle,
        ));
        self.ready.post(1);
        trace!(
            ?fiber,
            depth = thread.wait_depth(),
            main = thread.is_main(),
            "fiber suspended in nested wait"
        );

        let stack = self.run_nested_frame(thread, stack);

        thread.return_wait_stack(stack);
        thread.pop_waiter();
        thread.set_running(Some(fiber));
        slot.set_state(FiberState::Running);
        Ok(())
    }

    /// Runs a nested scheduler context on `stack` until it hands control
    /// back to the waiter, and returns the stack.
    fn run_nested_frame(&self, thread: &Rc<ThreadData>, stack: DefaultStack) -> DefaultStack {
        let scheduler: *const Scheduler = self;
        let data: *const ThreadData = Rc::as_ptr(thread);
        let mut frame: Coroutine<(), (), (), DefaultStack> =
            Coroutine::with_stack(stack, move |_, ()| {
                // SAFETY: the caller blocks in `resume` below until this
                // coroutine returns, keeping both pointers valid.
                let (scheduler, thread) = unsafe { (&*scheduler, &*data) };
                scheduler.run_frame(thread, FrameKind::Nested);
            });
        frame.resume(());
        frame.into_stack()
    }

    /// The scheduling loop.
    pub(crate) fn run_frame(&self, thread: &ThreadData, kind: FrameKind) {
        let backoff = Backoff::new();
        loop {
            if kind == FrameKind::Root && self.stop.load(Ordering::Acquire) {
                break;
            }
            let epoch = self.completions.epoch();
            if !self.ready.acquire() {
                // Closed and empty.
                if kind == FrameKind::Root {
                    break;
                }
                self.stall(&backoff, epoch);
                continue;
            }
            if kind == FrameKind::Root && self.stop.load(Ordering::Acquire) {
                // Leave the permit for nested contexts still draining.
                self.ready.post(1);
                break;
            }

            match self
                .wait_lists
                .claim(thread.thread_id(), thread.innermost_waiter(), &self.counters)
            {
                Claim::Ready(entry) => {
                    backoff.reset();
                    if Some(entry.fiber) == thread.innermost_waiter() {
                        // Our waiter's children are done: return into its wait call.
                        return;
                    }
                    self.run_fiber(thread, entry.fiber);
                }
                Claim::Blocked => {
                    self.ready.post(1);
                    self.stall(&backoff, epoch);
                }
                Claim::Empty => {}
            }
        }
    }

    /// One non-blocking pass of the scheduling loop on the calling thread.
    pub(crate) fn pump(&self) -> bool {
        match self.current_thread() {
            Ok(thread) => self.pump_with(&thread),
            Err(err) => {
                error!(error = %err, "cannot pump on this thread");
                false
            }
        }
    }

    fn pump_with(&self, thread: &ThreadData) -> bool {
        if !self.ready.try_acquire() {
            return false;
        }
        // Only unowned fibers: a pump cannot hand control back to a waiter.
        match self.wait_lists.claim(thread.thread_id(), None, &self.counters) {
            Claim::Ready(entry) => {
                self.run_fiber(thread, entry.fiber);
                true
            }
            Claim::Blocked => {
                self.ready.post(1);
                false
            }
            Claim::Empty => false,
        }
    }

    /// Bounded backoff while every queued fiber is blocked.
    fn stall(&self, backoff: &Backoff, epoch: u64) {
        if backoff.is_completed() {
            trace!(scheduler = self.id, "all queued fibers blocked, parking");
            self.completions.wait_since(epoch, STALL_PARK);
        } else {
            backoff.snooze();
        }
    }

    /// Resumes a claimed fiber until its job finished, then retires it.
    fn run_fiber(&self, thread: &ThreadData, id: FiberId) {
        let pool = self.pool(id.class);
        let Some(fiber) = pool.get(id) else {
            error!(?id, "wait list held a stale fiber");
            return;
        };
        // SAFETY: claiming the entry made this thread the slot's only user.
        let Some(meta) = (unsafe { fiber.meta() }) else {
            error!(?id, "claimed fiber carries no job");
            return;
        };
        trace!(?id, stack = fiber.stack_index(), job = meta.job_index, "resuming fiber");

        // Restored afterwards: a job may pump, running this fiber on top of itself.
        let outer = thread.running();
        fiber.set_state(FiberState::Running);
        let runner: &(dyn JobRunner + 'static) = self;
        let input = FiberInput {
            runner: std::ptr::from_ref(runner),
            thread: std::ptr::from_ref(thread),
            fiber: id,
        };
        // SAFETY: `self` and `thread` outlive the resume.
        if let Err(payload) = unsafe { fiber.resume(input) } {
            error!(?id, "fiber trampoline panicked: {}", panic_message(payload.as_ref()));
        }
        thread.set_running(outer);

        // Free the slot before the counter can reach zero, so a handle seen
        // as done implies all its fibers are back in the pool.
        pool.delete_fiber(id);
        match self.counters.decrement(meta.counter) {
            Decrement::Completed => self.completions.notify(),
            Decrement::Pending(_) => {}
            Decrement::Stale => {
                error!(handle = ?meta.counter, "job counter released before its jobs finished")
            }
        }
    }

    /// Stops root loops and wakes every parked worker.
    pub(crate) fn request_stop(&self) {
        debug!(
            scheduler = self.id,
            permits = self.ready.permits(),
            "stopping scheduling loops"
        );
        self.stop.store(true, Ordering::Release);
        self.ready.close();
        self.completions.notify();
    }

    /// Marks every thread's state for this scheduler as dead. Each thread
    /// drops its entry, and the wait stacks with it, on its next registry access.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Forgets everything still queued; returns how many fibers were dropped.
    pub(crate) fn abandon_queued(&self) -> usize {
        let entries = self.wait_lists.drain();
        for entry in &entries {
            self.pool(entry.fiber.class).delete_fiber(entry.fiber);
        }
        entries.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.retire();
    }
}

impl JobRunner for Scheduler {
    fn run_job(&self, id: FiberId) {
        let Some(fiber) = self.pool(id.class).get(id) else {
            return;
        };
        // SAFETY: called from the fiber's own trampoline.
        let (job, meta) = unsafe { (fiber.take_job(), fiber.meta()) };
        let (Some(job), Some(meta)) = (job, meta) else {
            return;
        };

        let ctx = Context::new(self, meta.job_index);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.execute(&ctx))) {
            error!(
                job = meta.job_index,
                "job panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}
