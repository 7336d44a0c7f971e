//! Fiber management and execution context.
//!
//! A fiber is a slot in a [`FiberPool`](crate::fiber_pool::FiberPool): a
//! stackful coroutine bound to one pre-allocated stack, plus the job it is
//! currently carrying. The coroutine body is a trampoline that loops forever,
//! running one job per resume and suspending once the job is finished, so a
//! slot's coroutine is built once and reused for every job it carries.

use crate::counter::JobHandle;
use crate::job::{Job, JobPriority, PoolClass};
use crate::thread_data::ThreadData;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use std::any::Any;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Generation-checked name of a fiber slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FiberId {
    pub(crate) class: PoolClass,
    pub(crate) index: u16,
    pub(crate) generation: u32,
}

/// Lifecycle of a fiber slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FiberState {
    /// On the pool's free list.
    Free = 0,
    /// Carrying a job that has not started yet.
    Ready = 1,
    /// Resumed on some thread.
    Running = 2,
    /// Suspended in a nested wait, pinned to the thread that waited.
    Blocked = 3,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Blocked,
            _ => FiberState::Free,
        }
    }
}

/// Runs the job carried by a fiber. Implemented by the scheduler.
pub(crate) trait JobRunner {
    fn run_job(&self, fiber: FiberId);
}

/// What a fiber coroutine receives each time it is resumed.
#[derive(Clone, Copy)]
pub(crate) struct FiberInput {
    pub(crate) runner: *const (dyn JobRunner + 'static),
    pub(crate) thread: *const ThreadData,
    pub(crate) fiber: FiberId,
}

/// Every suspension of a fiber coroutine marks the end of a job.
type FiberCoroutine = Coroutine<FiberInput, (), (), DefaultStack>;

/// Per-job bookkeeping, written when the slot is handed out.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FiberMeta {
    pub(crate) counter: JobHandle,
    pub(crate) priority: JobPriority,
    pub(crate) job_index: u32,
}

pub(crate) struct Fiber {
    /// Always `Some` outside of `recycle`.
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    job: UnsafeCell<Option<Job>>,
    meta: UnsafeCell<Option<FiberMeta>>,
    state: AtomicU8,
    generation: AtomicU32,
    stack_index: u16,
}

// A slot is only touched by whoever holds its current `FiberId`: the
// dispatching thread until it is enqueued, then the single thread that
// claimed it from the wait lists.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

fn trampoline(yielder: &Yielder<FiberInput, ()>, mut input: FiberInput) {
    loop {
        // SAFETY: the resuming scheduler keeps the runner and the thread data
        // alive until this resume returns.
        let runner = unsafe { &*input.runner };
        let thread = unsafe { &*input.thread };

        thread.set_running(Some(input.fiber));
        runner.run_job(input.fiber);
        thread.set_running(None);

        input = yielder.suspend(());
    }
}

fn build_coroutine(stack: DefaultStack) -> FiberCoroutine {
    Coroutine::with_stack(stack, trampoline)
}

impl Fiber {
    pub(crate) fn new(stack: DefaultStack, stack_index: u16) -> Self {
        Fiber {
            coroutine: UnsafeCell::new(Some(build_coroutine(stack))),
            job: UnsafeCell::new(None),
            meta: UnsafeCell::new(None),
            state: AtomicU8::new(FiberState::Free as u8),
            generation: AtomicU32::new(0),
            stack_index,
        }
    }

    pub(crate) fn stack_index(&self) -> u16 {
        self.stack_index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every outstanding id for this slot.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Loads a job into a free slot.
    ///
    /// # Safety
    /// The caller must own the slot (popped from the free list, not yet enqueued).
    pub(crate) unsafe fn prepare(&self, job: Job, meta: FiberMeta) {
        unsafe {
            self.recycle();
            *self.job.get() = Some(job);
            *self.meta.get() = Some(meta);
        }
        self.set_state(FiberState::Ready);
    }

    /// Rebuilds the coroutine if a panic escaped it and left it finished.
    unsafe fn recycle(&self) {
        let slot = unsafe { &mut *self.coroutine.get() };
        if slot.as_ref().is_some_and(|c| c.done()) {
            if let Some(finished) = slot.take() {
                *slot = Some(build_coroutine(finished.into_stack()));
            }
        }
    }

    /// # Safety
    /// Only the trampoline of this slot may take its job.
    pub(crate) unsafe fn take_job(&self) -> Option<Job> {
        unsafe { (*self.job.get()).take() }
    }

    /// # Safety
    /// The caller must own the slot.
    pub(crate) unsafe fn meta(&self) -> Option<FiberMeta> {
        unsafe { *self.meta.get() }
    }

    /// Drops the job (if it never ran) and forgets the batch bookkeeping.
    ///
    /// # Safety
    /// The caller must own the slot.
    pub(crate) unsafe fn clear(&self) {
        unsafe {
            *self.job.get() = None;
            *self.meta.get() = None;
        }
    }

    /// Resumes the coroutine until the carried job has finished.
    ///
    /// Returns the panic payload if something escaped the trampoline.
    ///
    /// # Safety
    /// The caller must have claimed the slot, and the runner and thread data
    /// named in `input` must outlive the call.
    pub(crate) unsafe fn resume(&self, input: FiberInput) -> Result<(), Box<dyn Any + Send>> {
        let slot = unsafe { &mut *self.coroutine.get() };
        let Some(coroutine) = slot.as_mut() else {
            return Ok(());
        };
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| coroutine.resume(input)));
        match result {
            Ok(CoroutineResult::Yield(())) | Ok(CoroutineResult::Return(())) => Ok(()),
            Err(payload) => Err(payload),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}
