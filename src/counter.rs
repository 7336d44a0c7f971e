//! Counter-based synchronization primitives for job completion tracking.
//!
//! Every dispatched batch gets one counter from a fixed-capacity pool. The
//! counter starts at the number of fibers the batch actually got and is
//! decremented once per completed fiber. A [`JobHandle`] names a counter slot
//! together with the slot's generation, so a handle that outlives its counter
//! (or a late decrement against a recycled slot) is detected instead of
//! corrupting the batch that reuses the slot.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque completion handle returned by a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    index: u32,
    generation: u32,
}

impl JobHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[inline]
fn pack(generation: u32, value: u32) -> u64 {
    ((generation as u64) << 32) | value as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Result of decrementing a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// The counter is still above zero.
    Pending(u32),
    /// This decrement brought the counter to zero.
    Completed,
    /// The handle no longer names a live counter, or the counter was already zero.
    Stale,
}

/// Fixed-capacity pool of job counters.
pub struct CounterPool {
    /// Generation in the high half, value in the low half.
    slots: Box<[AtomicU64]>,
    free: Mutex<Vec<u32>>,
}

impl CounterPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| AtomicU64::new(pack(0, 0))).collect();
        // Reverse so that slot 0 is handed out first.
        let free = (0..capacity as u32).rev().collect();
        CounterPool {
            slots,
            free: Mutex::new(free),
        }
    }

    /// Reserves a counter with value zero. Returns `None` if the pool is exhausted.
    pub fn allocate(&self) -> Option<JobHandle> {
        let index = self.free.lock().pop()?;
        let (generation, _) = unpack(self.slots[index as usize].load(Ordering::Acquire));
        Some(JobHandle { index, generation })
    }

    /// Sets the initial value of a freshly allocated counter.
    ///
    /// Must happen before any fiber referencing the counter is enqueued.
    pub fn arm(&self, handle: JobHandle, value: u32) {
        if let Some(slot) = self.slots.get(handle.index as usize) {
            slot.store(pack(handle.generation, value), Ordering::Release);
        }
    }

    /// Current value of the counter, or `None` if the handle is stale.
    pub fn value(&self, handle: JobHandle) -> Option<u32> {
        let slot = self.slots.get(handle.index as usize)?;
        let (generation, value) = unpack(slot.load(Ordering::Acquire));
        (generation == handle.generation).then_some(value)
    }

    /// True when the counter reached zero or the handle was already released.
    pub fn is_done(&self, handle: JobHandle) -> bool {
        self.value(handle).is_none_or(|value| value == 0)
    }

    /// Decrements the counter by one.
    ///
    /// Uses Release ordering so all work done by the completing fiber is
    /// visible to whoever observes the counter at zero.
    pub fn decrement(&self, handle: JobHandle) -> Decrement {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return Decrement::Stale;
        };
        let result = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let (generation, value) = unpack(word);
            if generation != handle.generation || value == 0 {
                None
            } else {
                Some(pack(generation, value - 1))
            }
        });
        match result {
            Ok(previous) => match unpack(previous).1 {
                1 => Decrement::Completed,
                value => Decrement::Pending(value - 1),
            },
            Err(_) => Decrement::Stale,
        }
    }

    /// Returns the counter to the pool, invalidating every copy of `handle`.
    ///
    /// Returns false if the handle was already released.
    pub fn release(&self, handle: JobHandle) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return false;
        };
        let mut free = self.free.lock();
        let word = slot.load(Ordering::Acquire);
        let (generation, _) = unpack(word);
        if generation != handle.generation {
            return false;
        }
        slot.store(pack(generation.wrapping_add(1), 0), Ordering::Release);
        free.push(handle.index);
        true
    }

    /// Counters currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
