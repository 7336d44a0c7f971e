//! Worker thread implementation.
//!
//! Each worker registers its own thread data with the scheduler and then runs
//! the root scheduling loop until shutdown. Workers never own jobs: every
//! fiber lives in the shared wait lists until some thread claims it.

use crate::config::PinningStrategy;
use crate::error::DispatchError;
use crate::scheduler::{FrameKind, Scheduler};
use crate::thread_data;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// A worker thread running the scheduling loop.
pub(crate) struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a named worker thread, pinned according to `pinning`.
    fn spawn(
        id: usize,
        scheduler: Arc<Scheduler>,
        pinning: PinningStrategy,
        core_ids: &[core_affinity::CoreId],
    ) -> std::io::Result<Self> {
        let core = pinning
            .core_index(id, core_ids.len())
            .and_then(|index| core_ids.get(index).copied());

        let handle = thread::Builder::new()
            .name(format!("fiber-worker-{id}"))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        warn!(worker = id, core = core.id, "failed to pin worker thread");
                    }
                }
                Worker::run_loop(id, &scheduler);
            })?;

        Ok(Worker {
            id,
            handle: Some(handle),
        })
    }

    fn run_loop(id: usize, scheduler: &Scheduler) {
        let thread = match scheduler.register_thread(false) {
            Ok(thread) => thread,
            Err(err) => {
                error!(worker = id, error = %err, "worker could not allocate its wait stacks");
                return;
            }
        };
        debug!(worker = id, thread_id = thread.thread_id(), "worker started");

        scheduler.run_frame(&thread, FrameKind::Root);

        drop(thread);
        thread_data::unregister(scheduler.id());
        debug!(worker = id, "worker stopped");
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// The dispatcher's worker threads.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    scheduler: Arc<Scheduler>,
}

impl WorkerPool {
    /// Spawns `num_threads` workers.
    ///
    /// If any spawn fails, the workers already running are stopped and
    /// joined before the error is returned.
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        num_threads: usize,
        pinning: PinningStrategy,
    ) -> Result<Self, DispatchError> {
        let core_ids = match pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_else(|| {
                warn!(?pinning, "could not detect cores, workers will not be pinned");
                Vec::new()
            }),
        };

        let mut workers = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            match Worker::spawn(id, Arc::clone(&scheduler), pinning, &core_ids) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    error!(worker = id, error = %source, "failed to spawn worker thread");
                    let pool = WorkerPool { workers, scheduler };
                    let _ = pool.shutdown();
                    return Err(DispatchError::ThreadSpawn { index: id, source });
                }
            }
        }

        Ok(WorkerPool { workers, scheduler })
    }

    /// Returns the number of worker threads in the pool.
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops the scheduling loops and waits for all threads to finish.
    ///
    /// Returns Ok if all workers shut down successfully, or Err with the
    /// number of workers that panicked.
    pub(crate) fn shutdown(self) -> Result<(), usize> {
        self.scheduler.request_stop();

        let mut failed_count = 0;
        for worker in self.workers {
            let worker_id = worker.id();
            if worker.join().is_err() {
                failed_count += 1;
                error!(worker = worker_id, "worker panicked during execution");
            }
        }

        if failed_count > 0 {
            Err(failed_count)
        } else {
            Ok(())
        }
    }
}
