//! Dispatcher configuration.
//!
//! Every field has a default, so a partially specified configuration (for
//! example one deserialized from a settings file with only a few keys) is
//! filled in with the values below. Zero-valued counts and sizes are treated
//! the same as "use the default".

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};

/// Default number of fibers in the small-stack pool.
pub const DEFAULT_MAX_SMALL_FIBERS: u16 = 128;
/// Default number of fibers in the big-stack pool.
pub const DEFAULT_MAX_BIG_FIBERS: u16 = 32;
/// Default stack size of a small fiber: 64KB.
pub const DEFAULT_SMALL_STACK_SIZE: usize = 64 * 1024;
/// Default stack size of a big fiber: 512KB.
pub const DEFAULT_BIG_STACK_SIZE: usize = 512 * 1024;
/// Default number of nested waits a single thread can have in flight.
pub const MAX_WAIT_STACKS: usize = 32;
/// Default stack size of a nested-wait scheduler context.
pub const WAIT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack we accept for any coroutine.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Returns the index into the detected core list for worker `worker_id`,
    /// or `None` when this strategy does not pin.
    pub fn core_index(&self, worker_id: usize, num_cores: usize) -> Option<usize> {
        if num_cores == 0 {
            return None;
        }
        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(worker_id % num_cores),
            PinningStrategy::AvoidSMT => {
                let physical = num_cores.div_ceil(2);
                Some((worker_id % physical) * 2)
            }
        }
    }
}

/// Configuration for a [`JobDispatcher`](crate::JobDispatcher).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of fibers with a small stack. Default: 128.
    pub max_small_fibers: u16,
    /// Stack size for small fibers in bytes. Default: 64KB.
    pub small_stack_size: usize,
    /// Number of fibers with a big stack. Default: 32.
    pub max_big_fibers: u16,
    /// Stack size for big fibers in bytes. Default: 512KB.
    pub big_stack_size: usize,
    /// Worker threads to spawn. `None` means one less than the hardware thread count.
    pub num_workers: Option<u8>,
    /// How worker threads are pinned to cores.
    pub pinning: PinningStrategy,
    /// Nested waits each thread can have in flight. Default: 32.
    pub wait_stacks_per_thread: usize,
    /// Stack size of each nested-wait scheduler context. Default: 64KB.
    pub wait_stack_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_small_fibers: DEFAULT_MAX_SMALL_FIBERS,
            small_stack_size: DEFAULT_SMALL_STACK_SIZE,
            max_big_fibers: DEFAULT_MAX_BIG_FIBERS,
            big_stack_size: DEFAULT_BIG_STACK_SIZE,
            num_workers: None,
            pinning: PinningStrategy::None,
            wait_stacks_per_thread: MAX_WAIT_STACKS,
            wait_stack_size: WAIT_STACK_SIZE,
        }
    }
}

impl DispatcherConfig {
    /// Default configuration with an explicit worker count.
    pub fn with_workers(num_workers: u8) -> Self {
        Self {
            num_workers: Some(num_workers),
            ..Self::default()
        }
    }

    /// Replaces zero counts and sizes with their defaults and checks the rest.
    pub(crate) fn resolved(&self) -> Result<Self, DispatchError> {
        let mut config = self.clone();
        if config.max_small_fibers == 0 {
            config.max_small_fibers = DEFAULT_MAX_SMALL_FIBERS;
        }
        if config.max_big_fibers == 0 {
            config.max_big_fibers = DEFAULT_MAX_BIG_FIBERS;
        }
        if config.small_stack_size == 0 {
            config.small_stack_size = DEFAULT_SMALL_STACK_SIZE;
        }
        if config.big_stack_size == 0 {
            config.big_stack_size = DEFAULT_BIG_STACK_SIZE;
        }
        if config.wait_stack_size == 0 {
            config.wait_stack_size = WAIT_STACK_SIZE;
        }
        if config.num_workers.is_none() {
            config.num_workers = Some(default_worker_count());
        }

        for (name, size) in [
            ("small_stack_size", config.small_stack_size),
            ("big_stack_size", config.big_stack_size),
            ("wait_stack_size", config.wait_stack_size),
        ] {
            if size < MIN_STACK_SIZE {
                return Err(DispatchError::InvalidConfig(format!(
                    "{name} must be at least {MIN_STACK_SIZE} bytes, got {size}"
                )));
            }
        }
        Ok(config)
    }

    /// Worker count after resolution.
    pub(crate) fn worker_count(&self) -> u8 {
        self.num_workers.unwrap_or_else(default_worker_count)
    }
}

/// One worker per hardware thread, minus the main thread.
fn default_worker_count() -> u8 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).min(u8::MAX as usize) as u8
}
