use crate::counter::JobHandle;
use crate::error::DispatchError;
use crate::fiber::{Fiber, FiberId, FiberMeta, FiberState};
use crate::job::{Job, PoolClass};
use crate::stack::StackPool;
use parking_lot::Mutex;
use tracing::error;

/// A fixed-capacity pool of fibers, each bound to its own pre-allocated stack.
///
/// Free slots are kept on a LIFO index list so recently used stacks (still
/// warm in cache) are handed out first.
pub(crate) struct FiberPool {
    class: PoolClass,
    fibers: Box<[Fiber]>,
    free: Mutex<Vec<u16>>,
    stack_size: usize,
}

impl FiberPool {
    /// Allocates `max_fibers` fibers with `stack_size` byte stacks.
    ///
    /// Fails without keeping anything if a single stack cannot be allocated.
    pub(crate) fn new(class: PoolClass, max_fibers: u16, stack_size: usize) -> Result<Self, DispatchError> {
        let mut stacks = StackPool::new(max_fibers as usize, stack_size)?;
        let fibers: Box<[Fiber]> = stacks
            .drain()
            .enumerate()
            .map(|(index, stack)| Fiber::new(stack, index as u16))
            .collect();
        let free = (0..max_fibers).rev().collect();

        Ok(FiberPool {
            class,
            fibers,
            free: Mutex::new(free),
            stack_size,
        })
    }

    /// Pops a free slot and loads `job` into it.
    ///
    /// Returns `None` when the pool is exhausted; the job is dropped.
    pub(crate) fn new_fiber(&self, job: Job, job_index: u32, counter: JobHandle) -> Option<FiberId> {
        let mut free = self.free.lock();
        let index = free.pop()?;
        let fiber = &self.fibers[index as usize];
        let meta = FiberMeta {
            counter,
            priority: job.priority(),
            job_index,
        };
        // SAFETY: the index was just taken off the free list under the pool lock.
        unsafe { fiber.prepare(job, meta) };
        Some(FiberId {
            class: self.class,
            index,
            generation: fiber.generation(),
        })
    }

    /// Returns a slot to the free list.
    ///
    /// A stale id (double delete) is logged and ignored.
    pub(crate) fn delete_fiber(&self, id: FiberId) -> bool {
        let mut free = self.free.lock();
        let Some(fiber) = self.get(id) else {
            error!(?id, "attempted to free a fiber slot that is not live");
            return false;
        };
        if fiber.state() == FiberState::Free {
            error!(?id, "attempted to free a fiber slot twice");
            return false;
        }
        // SAFETY: the caller held the live id, so it owns the slot.
        unsafe { fiber.clear() };
        fiber.set_state(FiberState::Free);
        fiber.bump_generation();
        free.push(id.index);
        true
    }

    /// The slot named by `id`, if the id is still current.
    pub(crate) fn get(&self, id: FiberId) -> Option<&Fiber> {
        if id.class != self.class {
            return None;
        }
        let fiber = self.fibers.get(id.index as usize)?;
        (fiber.generation() == id.generation).then_some(fiber)
    }

    pub(crate) fn class(&self) -> PoolClass {
        self.class
    }

    /// Slots currently on the free list.
    pub(crate) fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.fibers.len()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterPool;
    use crate::job::JobPriority;

    fn handle() -> JobHandle {
        CounterPool::new(1).allocate().unwrap()
    }

    #[test]
    fn test_pool_creation() {
        let pool = FiberPool::new(PoolClass::Small, 8, 64 * 1024).unwrap();
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.stack_size(), 64 * 1024);
        assert_eq!(pool.class(), PoolClass::Small);
    }

    #[test]
    fn test_new_fiber_hands_out_lowest_slot_first() {
        let pool = FiberPool::new(PoolClass::Big, 4, 64 * 1024).unwrap();
        let id = pool.new_fiber(Job::new(|_| {}), 0, handle()).unwrap();
        assert_eq!(id.index, 0);
        assert_eq!(id.class, PoolClass::Big);

        let fiber = pool.get(id).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.stack_index(), 0);
        let meta = unsafe { fiber.meta() }.unwrap();
        assert_eq!(meta.priority, JobPriority::Normal);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = FiberPool::new(PoolClass::Small, 2, 64 * 1024).unwrap();
        let counter = handle();
        assert!(pool.new_fiber(Job::new(|_| {}), 0, counter).is_some());
        assert!(pool.new_fiber(Job::new(|_| {}), 1, counter).is_some());
        assert!(pool.new_fiber(Job::new(|_| {}), 2, counter).is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_delete_is_lifo_and_rejects_double_free() {
        let pool = FiberPool::new(PoolClass::Small, 4, 64 * 1024).unwrap();
        let counter = handle();
        let a = pool.new_fiber(Job::new(|_| {}), 0, counter).unwrap();
        let b = pool.new_fiber(Job::new(|_| {}), 1, counter).unwrap();

        assert!(pool.delete_fiber(a));
        assert!(!pool.delete_fiber(a), "second delete must be refused");
        assert!(pool.get(a).is_none(), "stale id must not resolve");
        assert_eq!(pool.available(), 3);

        // The slot freed last is reused first, under a new generation.
        let c = pool.new_fiber(Job::new(|_| {}), 2, counter).unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);

        assert!(pool.delete_fiber(b));
        assert!(pool.delete_fiber(c));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_ids_do_not_cross_pools() {
        let small = FiberPool::new(PoolClass::Small, 1, 64 * 1024).unwrap();
        let big = FiberPool::new(PoolClass::Big, 1, 64 * 1024).unwrap();
        let id = small.new_fiber(Job::new(|_| {}), 0, handle()).unwrap();
        assert!(big.get(id).is_none());
        assert!(!big.delete_fiber(id));
        assert!(small.delete_fiber(id));
    }
}
