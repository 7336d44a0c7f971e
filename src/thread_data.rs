//! Per-thread scheduling state.
//!
//! Every thread that runs fibers for a dispatcher owns one `ThreadData`:
//! worker threads register at start, the thread that created the dispatcher
//! registers during init, and any other thread that waits or pumps is
//! registered the first time it does so. The data lives in a thread-local
//! list keyed by dispatcher id, so independent dispatchers never see each
//! other's state.

use crate::fiber::FiberId;
use crate::stack::StackPool;
use corosensei::stack::DefaultStack;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct ThreadData {
    scheduler_id: u64,
    /// Set once the owning dispatcher has shut down.
    retired: Arc<AtomicBool>,
    thread_id: u32,
    is_main: bool,
    /// Fiber whose job is executing on this thread right now.
    running: Cell<Option<FiberId>>,
    /// Spare stacks for nested scheduler contexts.
    wait_stacks: RefCell<StackPool>,
    /// Fibers suspended in a nested wait on this thread, innermost last.
    /// Each one resumes by returning out of the scheduler context above it.
    waiting: RefCell<Vec<FiberId>>,
}

impl ThreadData {
    pub(crate) fn new(
        scheduler_id: u64,
        retired: Arc<AtomicBool>,
        thread_id: u32,
        is_main: bool,
        wait_stacks: StackPool,
    ) -> Self {
        ThreadData {
            scheduler_id,
            retired,
            thread_id,
            is_main,
            running: Cell::new(None),
            waiting: RefCell::new(Vec::with_capacity(wait_stacks.capacity())),
            wait_stacks: RefCell::new(wait_stacks),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub(crate) fn is_main(&self) -> bool {
        self.is_main
    }

    pub(crate) fn running(&self) -> Option<FiberId> {
        self.running.get()
    }

    pub(crate) fn set_running(&self, fiber: Option<FiberId>) {
        self.running.set(fiber);
    }

    pub(crate) fn take_wait_stack(&self) -> Option<DefaultStack> {
        self.wait_stacks.borrow_mut().pop()
    }

    pub(crate) fn return_wait_stack(&self, stack: DefaultStack) {
        self.wait_stacks.borrow_mut().push(stack);
    }

    pub(crate) fn max_wait_stacks(&self) -> usize {
        self.wait_stacks.borrow().capacity()
    }

    pub(crate) fn push_waiter(&self, fiber: FiberId) {
        self.waiting.borrow_mut().push(fiber);
    }

    pub(crate) fn pop_waiter(&self) -> Option<FiberId> {
        self.waiting.borrow_mut().pop()
    }

    /// The only suspended fiber the current scheduler context may resume.
    pub(crate) fn innermost_waiter(&self) -> Option<FiberId> {
        self.waiting.borrow().last().copied()
    }

    pub(crate) fn wait_depth(&self) -> usize {
        self.waiting.borrow().len()
    }
}

thread_local! {
    static THREADS: RefCell<Vec<Rc<ThreadData>>> = const { RefCell::new(Vec::new()) };
}

/// Installs `data` as this thread's state for its dispatcher.
///
/// Entries of dispatchers that shut down on another thread are dropped here,
/// releasing their wait stacks.
pub(crate) fn register(data: ThreadData) -> Rc<ThreadData> {
    let data = Rc::new(data);
    THREADS.with(|threads| {
        let mut threads = threads.borrow_mut();
        threads.retain(|t| t.scheduler_id != data.scheduler_id && !t.is_retired());
        threads.push(data.clone());
    });
    data
}

/// This thread's state for dispatcher `scheduler_id`, if registered.
///
/// Never inlined: fiber code may run on different threads between calls, so
/// the thread-local address must be looked up fresh every time.
#[inline(never)]
pub(crate) fn current(scheduler_id: u64) -> Option<Rc<ThreadData>> {
    THREADS.with(|threads| {
        let mut threads = threads.borrow_mut();
        threads.retain(|t| !t.is_retired());
        threads
            .iter()
            .find(|t| t.scheduler_id == scheduler_id)
            .cloned()
    })
}

/// Drops this thread's state for dispatcher `scheduler_id`.
#[inline(never)]
pub(crate) fn unregister(scheduler_id: u64) {
    // The list may already be gone if this runs during thread teardown.
    let _ = THREADS.try_with(|threads| {
        threads
            .borrow_mut()
            .retain(|t| t.scheduler_id != scheduler_id)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::PoolClass;

    fn live() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn fiber(index: u16) -> FiberId {
        FiberId {
            class: PoolClass::Small,
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_wait_stack_pool() {
        let data = ThreadData::new(1, live(), 1, false, StackPool::new(2, 64 * 1024).unwrap());
        assert_eq!(data.max_wait_stacks(), 2);

        let a = data.take_wait_stack().unwrap();
        let b = data.take_wait_stack().unwrap();
        assert!(data.take_wait_stack().is_none());

        data.return_wait_stack(a);
        data.return_wait_stack(b);
        assert!(data.take_wait_stack().is_some());
    }

    #[test]
    fn test_waiters_are_lifo() {
        let data = ThreadData::new(1, live(), 1, true, StackPool::new(0, 64 * 1024).unwrap());
        assert_eq!(data.innermost_waiter(), None);

        data.push_waiter(fiber(3));
        data.push_waiter(fiber(7));
        assert_eq!(data.innermost_waiter(), Some(fiber(7)));
        assert_eq!(data.wait_depth(), 2);

        assert_eq!(data.pop_waiter(), Some(fiber(7)));
        assert_eq!(data.innermost_waiter(), Some(fiber(3)));
    }

    #[test]
    fn test_registry_is_keyed_by_dispatcher() {
        let empty = || StackPool::new(0, 64 * 1024).unwrap();
        register(ThreadData::new(1001, live(), 5, true, empty()));
        register(ThreadData::new(1002, live(), 9, false, empty()));

        assert_eq!(current(1001).unwrap().thread_id(), 5);
        assert_eq!(current(1002).unwrap().thread_id(), 9);
        assert!(current(1003).is_none());

        unregister(1001);
        assert!(current(1001).is_none());
        assert!(current(1002).is_some());
        unregister(1002);
    }

    #[test]
    fn test_retired_entries_are_dropped() {
        let retired = live();
        let stale = register(ThreadData::new(
            2001,
            retired.clone(),
            1,
            true,
            StackPool::new(2, 64 * 1024).unwrap(),
        ));
        assert!(current(2001).is_some());

        retired.store(true, Ordering::Release);
        assert!(current(2001).is_none());
        // The registry no longer holds the entry, so its stacks go with the last Rc.
        assert_eq!(Rc::strong_count(&stale), 1);
    }
}
