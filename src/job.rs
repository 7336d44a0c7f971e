//! Job definitions.
//!
//! Jobs are units of work that can be executed by the fiber system.
//! A job is a closure plus the priority bucket it is scheduled from.

use crate::context::Context;
use serde::{Deserialize, Serialize};

/// Priority bucket a job is scheduled from. Buckets are scanned High first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobPriority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl JobPriority {
    pub const COUNT: usize = 3;

    /// All priorities in scan order.
    pub const ALL: [JobPriority; Self::COUNT] =
        [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub(crate) fn bucket(self) -> usize {
        self as usize
    }
}

/// Which fiber pool a batch of jobs draws its fibers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolClass {
    /// Many fibers with small stacks, for shallow callbacks.
    Small,
    /// Few fibers with big stacks, for deep call chains.
    Big,
}

/// A unit of work to be executed by the job dispatcher.
///
/// The closure owns whatever user data it needs. It receives a [`Context`]
/// that carries its index within the dispatched batch and lets it dispatch
/// and wait on further jobs.
pub struct Job {
    work: Box<dyn FnOnce(&Context) + Send + 'static>,
    priority: JobPriority,
}

impl Job {
    /// Creates a normal priority job.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        Job {
            work: Box::new(work),
            priority: JobPriority::Normal,
        }
    }

    /// Sets the priority bucket of this job.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    /// Runs the job to completion on the calling stack.
    pub(crate) fn execute(self, ctx: &Context) {
        (self.work)(ctx);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
