use crate::{config, Kernel};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("limit of {max_concurrent_kernels} concurrent kernels reached")]
    LimitReached { max_concurrent_kernels: usize },

    #[error("block size {block_size} ({threads_per_block} threads) too large (limit is {max_threads_per_block} threads per block)")]
    BlockSizeTooLarge {
        block_size: trace_model::Dim,
        threads_per_block: usize,
        max_threads_per_block: usize,
    },
}

/// Admission control for kernels: the bounded window of running kernels and
/// the selection policy cores draw new work from.
#[derive(Debug)]
pub struct KernelManager {
    /// Kernel slots with their remaining launch latency.
    running_kernels: Box<[Option<(usize, Arc<Kernel>)>]>,
    last_issued_kernel: usize,
    config: Arc<config::GPU>,
}

impl KernelManager {
    #[must_use]
    pub fn new(config: Arc<config::GPU>) -> Self {
        Self {
            running_kernels: utils::box_slice![None; config.max_concurrent_kernels],
            last_issued_kernel: 0,
            config,
        }
    }

    /// Is a slot free (or holding a finished kernel)?
    #[must_use]
    pub fn can_start_kernel(&self) -> bool {
        self.running_kernels.iter().any(|slot| match slot {
            Some((_, kernel)) => kernel.done(),
            None => true,
        })
    }

    #[must_use]
    pub fn more_blocks_to_run(&self) -> bool {
        self.running_kernels.iter().any(|slot| match slot {
            Some((_, kernel)) => !kernel.no_more_blocks_to_run(),
            None => false,
        })
    }

    #[must_use]
    pub fn any_running(&self) -> bool {
        self.running_kernels.iter().any(Option::is_some)
    }

    pub fn decrement_launch_latency(&mut self) {
        for (latency, _) in self.running_kernels.iter_mut().flatten() {
            *latency = latency.saturating_sub(1);
        }
    }

    /// Insert a kernel into a free window slot.
    pub fn try_launch_kernel(
        &mut self,
        kernel: Arc<Kernel>,
        launch_latency: usize,
    ) -> Result<(), LaunchError> {
        let threads_per_block = kernel.threads_per_block();
        let max_threads_per_block = self.config.max_threads_per_core;
        if threads_per_block > max_threads_per_block {
            return Err(LaunchError::BlockSizeTooLarge {
                block_size: kernel.config.block,
                threads_per_block,
                max_threads_per_block,
            });
        }

        let max_concurrent_kernels = self.running_kernels.len();
        let free_slot = self
            .running_kernels
            .iter_mut()
            .find(|slot| match slot {
                Some((_, kernel)) => kernel.done(),
                None => true,
            })
            .ok_or(LaunchError::LimitReached {
                max_concurrent_kernels,
            })?;

        kernel.set_launched();
        *free_slot = Some((launch_latency, kernel));
        Ok(())
    }

    /// The kernel a core should draw blocks from.
    ///
    /// The most recently selected kernel keeps priority while it has blocks;
    /// then the next launched kernel in window order takes over.
    pub fn select_kernel(&mut self) -> Option<Arc<Kernel>> {
        if let Some((launch_latency, ref kernel)) = self.running_kernels[self.last_issued_kernel] {
            if !kernel.no_more_blocks_to_run() && launch_latency == 0 {
                return Some(Arc::clone(kernel));
            }
        }
        let num_slots = self.running_kernels.len();
        for i in 0..num_slots {
            let idx = (i + self.last_issued_kernel + 1) % num_slots;
            if let Some((launch_latency, ref kernel)) = self.running_kernels[idx] {
                if !kernel.no_more_blocks_to_run() && launch_latency == 0 {
                    self.last_issued_kernel = idx;
                    return Some(Arc::clone(kernel));
                }
            }
        }
        None
    }

    /// Remove and return a finished kernel from the window.
    pub fn get_finished_kernel(&mut self) -> Option<Arc<Kernel>> {
        let finished = self.running_kernels.iter_mut().find(|slot| {
            slot.as_ref()
                .is_some_and(|(_, kernel)| kernel.launched() && kernel.done())
        });
        finished.and_then(Option::take).map(|(_, kernel)| kernel)
    }

    /// Force-finish every kernel; used when a simulation limit is reached.
    pub fn stop_all_running_kernels(&mut self, cycle: u64) {
        for slot in self.running_kernels.iter_mut() {
            if let Some((_, kernel)) = slot.take() {
                kernel.set_completed(cycle);
            }
        }
    }
}
