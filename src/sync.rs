//! Blocking primitives used by the scheduling loop.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Counting semaphore whose permits track enqueued, unclaimed fibers.
///
/// Permits live in an atomic so the common post/try paths never take the
/// mutex; the mutex and condvar are only used to park threads that found
/// no permit. Permit and sleeper accesses are SeqCst: a poster that reads
/// zero sleepers is then guaranteed to be seen by the next permit check.
pub struct Semaphore {
    permits: AtomicUsize,
    sleepers: AtomicUsize,
    closed: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            permits: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Takes one permit if any is available.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1))
            .is_ok()
    }

    /// Parks until a permit is available and takes it.
    ///
    /// Returns false without a permit once the semaphore is closed and empty.
    pub fn acquire(&self) -> bool {
        if self.try_acquire() {
            return true;
        }
        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let acquired = loop {
            if self.try_acquire() {
                break true;
            }
            if self.closed.load(Ordering::Acquire) {
                break false;
            }
            self.cv.wait(&mut guard);
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        acquired
    }

    /// Adds `n` permits and wakes up to `n` sleepers.
    pub fn post(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.permits.fetch_add(n, Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        // Taking the lock orders this wakeup after a sleeper's final permit check.
        let _guard = self.lock.lock();
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    /// Wakes every sleeper; afterwards `acquire` stops blocking once permits run out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    pub fn permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Epoch counter bumped whenever a job counter reaches zero.
///
/// Threads that found only blocked fibers park here: a completed counter is
/// the only event that can turn a blocked fiber into a runnable one.
pub struct CompletionSignal {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        CompletionSignal {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Parks until the epoch moves past `seen` or `timeout` elapses.
    ///
    /// Returns true if a completion happened.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let mut epoch = self.epoch.lock();
        if *epoch != seen {
            return true;
        }
        let _ = self.cv.wait_for(&mut epoch, timeout);
        *epoch != seen
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}
