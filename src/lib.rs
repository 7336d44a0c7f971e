//! # fiber-jobs - Fiber-Based Job Dispatcher
//!
//! A job dispatcher that runs every job on its own stackful fiber, drawn from
//! one of two fixed pools (many small stacks, few big ones), and schedules the
//! fibers across a pool of worker threads from three priority wait lists.
//!
//! ## Architecture
//!
//! - **Fibers**: pre-allocated coroutines, one per running job, with a reusable stack
//! - **Wait lists**: High, Normal and Low queues of fibers waiting to run
//! - **Job counters**: atomic completion counters, one per dispatched batch
//! - **Worker threads**: OS threads running the scheduling loop
//!
//! A job may dispatch more jobs and wait on them. The wait suspends only the
//! job's fiber: its thread picks up a spare stack and keeps scheduling until
//! the children are done, then resumes the waiting job exactly where it left off.
//!
//! ## Example
//!
//! ```
//! use fiber_jobs::{DispatcherConfig, Job, JobDispatcher};
//!
//! let dispatcher = JobDispatcher::new(DispatcherConfig::with_workers(2)).unwrap();
//!
//! let handle = dispatcher
//!     .dispatch_small([Job::new(|ctx| {
//!         let children = (0..3).map(|_| Job::new(|ctx| println!("child {}", ctx.index())));
//!         if let Some(inner) = ctx.dispatch_small(children) {
//!             ctx.wait_and_delete(inner).unwrap();
//!         }
//!     })])
//!     .unwrap();
//!
//! dispatcher.wait_and_delete(handle).unwrap();
//! ```

pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod job;
pub mod job_dispatcher;

mod fiber;
mod fiber_pool;
mod scheduler;
mod stack;
mod sync;
mod thread_data;
mod wait_list;
mod worker;

pub use config::{DispatcherConfig, PinningStrategy};
pub use context::Context;
pub use counter::JobHandle;
pub use error::DispatchError;
pub use job::{Job, JobPriority, PoolClass};
pub use job_dispatcher::JobDispatcher;
