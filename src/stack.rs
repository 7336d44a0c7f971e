//! Pre-allocated coroutine stacks.
//!
//! Stacks come from `corosensei::stack::DefaultStack`, which maps the memory
//! with a guard page below the usable region so an overflow faults instead of
//! silently corrupting a neighbour.

use crate::error::DispatchError;
use corosensei::stack::DefaultStack;

/// A LIFO pool of equally sized execution stacks.
pub(crate) struct StackPool {
    stacks: Vec<DefaultStack>,
    capacity: usize,
}

impl StackPool {
    /// Allocates `count` stacks of `stack_size` bytes each.
    ///
    /// Either every stack is allocated or none survives: on failure the
    /// already-mapped stacks are released before the error is returned.
    pub(crate) fn new(count: usize, stack_size: usize) -> Result<Self, DispatchError> {
        let mut stacks = Vec::with_capacity(count);
        for _ in 0..count {
            let stack = DefaultStack::new(stack_size).map_err(|source| {
                DispatchError::StackAllocation {
                    size: stack_size,
                    source,
                }
            })?;
            stacks.push(stack);
        }
        Ok(StackPool {
            stacks,
            capacity: count,
        })
    }

    /// Takes a stack out of the pool.
    pub(crate) fn pop(&mut self) -> Option<DefaultStack> {
        self.stacks.pop()
    }

    /// Returns a stack previously taken with [`pop`](Self::pop).
    pub(crate) fn push(&mut self, stack: DefaultStack) {
        debug_assert!(self.stacks.len() < self.capacity, "stack pool overfilled");
        self.stacks.push(stack);
    }

    /// Moves every remaining stack out of the pool.
    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, DefaultStack> {
        self.stacks.drain(..)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corosensei::Coroutine;

    #[test]
    fn test_pop_push_cycle() {
        let mut pool = StackPool::new(4, 64 * 1024).unwrap();
        assert_eq!(pool.capacity(), 4);

        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        assert_eq!(pool.drain().len(), 2);

        pool.push(a);
        pool.push(b);
        assert_eq!(pool.drain().len(), 2);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let mut pool = StackPool::new(1, 64 * 1024).unwrap();
        let stack = pool.pop();
        assert!(stack.is_some());
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_stack_survives_coroutine() {
        let mut pool = StackPool::new(1, 64 * 1024).unwrap();
        let stack = pool.pop().unwrap();

        let mut coroutine: Coroutine<u32, (), u32, DefaultStack> =
            Coroutine::with_stack(stack, |_, input: u32| input * 2);
        let result = coroutine.resume(21);
        assert!(matches!(result, corosensei::CoroutineResult::Return(42)));

        pool.push(coroutine.into_stack());
        assert!(pool.pop().is_some());
    }
}
