//! Priority-bucketed queues of fibers waiting to run.
//!
//! A fiber sits in exactly one bucket while it waits to be claimed. The
//! entry carries everything needed to decide whether it may run on a given
//! thread, so the scan never has to touch the fiber slot itself.

use crate::counter::{CounterPool, JobHandle};
use crate::fiber::FiberId;
use crate::job::JobPriority;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Thread id meaning "not pinned to any thread".
pub(crate) const UNOWNED: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WaitEntry {
    pub(crate) fiber: FiberId,
    pub(crate) priority: JobPriority,
    /// Thread whose stack holds the fiber's suspended frames, or [`UNOWNED`].
    pub(crate) owner_thread: u32,
    /// Counter that must reach zero before the fiber may continue.
    pub(crate) wait_on: Option<JobHandle>,
}

impl WaitEntry {
    /// A fiber that has not started yet.
    pub(crate) fn fresh(fiber: FiberId, priority: JobPriority) -> Self {
        WaitEntry {
            fiber,
            priority,
            owner_thread: UNOWNED,
            wait_on: None,
        }
    }

    /// A fiber suspended in a nested wait on `owner_thread`.
    pub(crate) fn suspended(fiber: FiberId, priority: JobPriority, owner_thread: u32, wait_on: JobHandle) -> Self {
        WaitEntry {
            fiber,
            priority,
            owner_thread,
            wait_on: Some(wait_on),
        }
    }

    /// Whether the scheduler context on `thread_id`, whose own waiter is
    /// `innermost`, may take this entry.
    ///
    /// A suspended fiber resumes by returning out of the scheduler context it
    /// waited into, so only that context (the innermost one on its thread)
    /// can take it.
    fn runnable_on(&self, thread_id: u32, innermost: Option<FiberId>, counters: &CounterPool) -> bool {
        let children_done = self.wait_on.is_none_or(|handle| counters.is_done(handle));
        if !children_done {
            return false;
        }
        self.owner_thread == UNOWNED
            || (self.owner_thread == thread_id && innermost == Some(self.fiber))
    }
}

/// Outcome of one scan of the wait lists.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The entry was removed and now belongs to the caller.
    Ready(WaitEntry),
    /// Entries exist but none may run on this thread yet.
    Blocked,
    Empty,
}

pub(crate) struct WaitLists {
    buckets: Mutex<[VecDeque<WaitEntry>; JobPriority::COUNT]>,
}

impl WaitLists {
    pub(crate) fn new() -> Self {
        WaitLists {
            buckets: Mutex::new(Default::default()),
        }
    }

    /// Appends an entry at the tail of its priority bucket.
    pub(crate) fn push(&self, entry: WaitEntry) {
        self.buckets.lock()[entry.priority.bucket()].push_back(entry);
    }

    /// Appends a whole batch under a single lock acquisition.
    pub(crate) fn push_batch<I>(&self, entries: I)
    where
        I: IntoIterator<Item = WaitEntry>,
    {
        let mut buckets = self.buckets.lock();
        for entry in entries {
            buckets[entry.priority.bucket()].push_back(entry);
        }
    }

    /// Scans High to Low, front to back, and removes the first entry that may
    /// run on `thread_id`.
    pub(crate) fn claim(&self, thread_id: u32, innermost: Option<FiberId>, counters: &CounterPool) -> Claim {
        let mut buckets = self.buckets.lock();
        let mut any = false;
        for bucket in buckets.iter_mut() {
            any |= !bucket.is_empty();
            let found = bucket
                .iter()
                .position(|entry| entry.runnable_on(thread_id, innermost, counters));
            if let Some(position) = found {
                if let Some(entry) = bucket.remove(position) {
                    return Claim::Ready(entry);
                }
            }
        }
        if any { Claim::Blocked } else { Claim::Empty }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.lock().iter().map(VecDeque::len).sum()
    }

    /// Removes every entry, for shutdown bookkeeping.
    pub(crate) fn drain(&self) -> Vec<WaitEntry> {
        let mut buckets = self.buckets.lock();
        buckets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect()
    }
}
