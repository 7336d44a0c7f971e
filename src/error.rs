//! Error type shared by the dispatcher API.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatcher configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to allocate a {size} byte coroutine stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn worker thread {index}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    /// Returned by a nested wait when the calling thread has no spare wait
    /// stack left. The wait did not happen; the handle is still valid.
    #[error("maximum of {max} nested waits exceeded on this thread, cannot wait")]
    WaitStacksExhausted { max: usize },

    #[error("{0} worker thread(s) panicked")]
    WorkersPanicked(usize),
}
